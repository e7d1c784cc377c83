//! Plugin discovery and the in-memory tool catalog.
//!
//! A sync scans the plugin directory, diffs it against the last snapshot and
//! probes only what changed. Probing spawns `<plugin> --describe`, so it
//! happens with the state lock released; concurrent syncs queue on the sync
//! lane instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tether_cap::{normalize, SandboxController};
use tether_types::{default_input_schema, ToolSpecification};

use crate::process::{run_process, ProcessSpec};
use crate::select::{cache_key, select_tool_names, SelectionReport};
use crate::ToolError;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
struct FileStamp {
    modified_ns: u128,
    len: u64,
}

/// Plugin file name to modification stamp, taken on every sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolFileSnapshot {
    files: BTreeMap<String, FileStamp>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

impl ToolFileSnapshot {
    /// A missing directory scans as empty.
    pub fn scan(dir: &Path) -> io::Result<Self> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let mut files = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_eligible(&name) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(entry.path()) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            files.insert(name, FileStamp { modified_ns, len: meta.len() });
        }
        Ok(Self { files })
    }

    pub fn diff(&self, newer: &Self) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for (name, stamp) in &newer.files {
            match self.files.get(name) {
                None => diff.added.push(name.clone()),
                Some(old) if old != stamp => diff.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in self.files.keys() {
            if !newer.files.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn hash(&self) -> String {
        let mut h = Sha256::new();
        for (name, stamp) in &self.files {
            h.update(name.as_bytes());
            h.update(stamp.modified_ns.to_le_bytes());
            h.update(stamp.len.to_le_bytes());
        }
        hex::encode(h.finalize())
    }
}

/// Names starting with `_` are reserved for plugin helpers; dotfiles are ignored.
pub fn is_eligible(file_name: &str) -> bool {
    !file_name.starts_with('_') && !file_name.starts_with('.')
}

/// Program and leading args used to launch a plugin file.
pub fn plugin_command(path: &Path) -> (OsString, Vec<OsString>) {
    let interpreter = match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("sh"),
        Some("js") => Some("node"),
        _ => None,
    };
    match interpreter {
        Some(program) => (program.into(), vec![path.as_os_str().to_os_string()]),
        None => (path.as_os_str().to_os_string(), Vec::new()),
    }
}

/// Whole output as JSON, else the last line that parses.
pub fn parse_json_output(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{') || l.starts_with('['))
        .find_map(|l| serde_json::from_str(l).ok())
}

/// Turn a `--describe` payload into a specification, filling defaults.
pub fn parse_spec(value: Value, file: &str) -> Result<ToolSpecification, String> {
    let Value::Object(map) = value else {
        return Err("describe output is not a JSON object".into());
    };
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return Err("describe output has no tool name".into());
    }
    let text = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let input_schema = match map.get("input_schema") {
        Some(schema @ Value::Object(_)) => schema.clone(),
        Some(Value::Null) | None => default_input_schema(),
        Some(_) => return Err("input_schema must be a JSON object".into()),
    };
    let keywords = map
        .get("keywords")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Ok(ToolSpecification {
        name: name.to_string(),
        description: text("description").unwrap_or_else(|| format!("custom tool loaded from {file}")),
        version: text("version").unwrap_or_else(|| "0.1.0".into()),
        input_schema,
        network_access: map.get("network_access").and_then(Value::as_bool).unwrap_or(false),
        source_path: Some(file.to_string()),
        keywords,
    })
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadedPlugin {
    pub spec: ToolSpecification,
    pub file: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistryStatus {
    pub plugin_dir: PathBuf,
    pub loaded: Vec<PluginSummary>,
    pub load_errors: BTreeMap<String, String>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub cached_selections: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub file: String,
    pub version: String,
    pub network_access: bool,
}

#[derive(Default)]
struct RegistryState {
    snapshot: ToolFileSnapshot,
    plugins: BTreeMap<String, LoadedPlugin>,
    load_errors: BTreeMap<String, String>,
    last_scan_at: Option<DateTime<Utc>>,
    selections: HashMap<String, Vec<String>>,
    cache_hits: u64,
    cache_misses: u64,
}

impl RegistryState {
    fn membership(&self) -> BTreeSet<(String, String)> {
        self.plugins
            .values()
            .map(|p| (p.spec.name.clone(), p.file.clone()))
            .collect()
    }
}

pub struct ToolRegistry {
    plugin_dir: PathBuf,
    workdir: PathBuf,
    probe_timeout: Duration,
    sandbox: SandboxController,
    builtins: BTreeMap<String, ToolSpecification>,
    state: Mutex<RegistryState>,
    sync_lane: tokio::sync::Mutex<()>,
}

impl ToolRegistry {
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        sandbox: SandboxController,
        builtins: Vec<ToolSpecification>,
    ) -> Self {
        let workdir = sandbox.root().to_path_buf();
        let plugin_dir = plugin_dir.into();
        let plugin_dir = if plugin_dir.is_absolute() {
            normalize(&plugin_dir)
        } else {
            normalize(&workdir.join(plugin_dir))
        };
        Self {
            plugin_dir,
            workdir,
            probe_timeout: PROBE_TIMEOUT,
            sandbox,
            builtins: builtins.into_iter().map(|s| (s.name.clone(), s)).collect(),
            state: Mutex::new(RegistryState::default()),
            sync_lane: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// Bring the catalog in line with the plugin directory.
    ///
    /// Returns whether the set of loaded (name, file) pairs changed.
    pub async fn sync(&self, force: bool) -> Result<bool, ToolError> {
        let _lane = self.sync_lane.lock().await;
        let fresh = ToolFileSnapshot::scan(&self.plugin_dir)?;

        let (to_probe, removed) = {
            let state = self.state();
            let diff = state.snapshot.diff(&fresh);
            if !force && diff.is_empty() && state.last_scan_at.is_some() {
                return Ok(false);
            }
            let mut to_probe: Vec<String> = if force {
                fresh.files().map(str::to_string).collect()
            } else {
                diff.added.iter().chain(&diff.changed).cloned().collect()
            };
            to_probe.sort();
            (to_probe, diff.removed)
        };

        let mut probed = Vec::with_capacity(to_probe.len());
        for file in &to_probe {
            let result = self.probe(file).await;
            probed.push((file.clone(), result));
        }

        let mut state = self.state();
        let before = state.membership();
        let snapshot_changed = state.snapshot != fresh;

        let stale: BTreeSet<&String> = removed.iter().chain(&to_probe).collect();
        state.plugins.retain(|_, p| !stale.contains(&p.file));
        state.load_errors.retain(|file, _| !stale.contains(file));

        for (file, result) in probed {
            let spec = match result {
                Ok(spec) => spec,
                Err(reason) => {
                    tracing::warn!(file = %file, error = %reason, "plugin failed to load");
                    state.load_errors.insert(file, reason);
                    continue;
                }
            };
            if self.builtins.contains_key(&spec.name) {
                let reason = format!("tool name '{}' collides with a built-in tool", spec.name);
                tracing::warn!(file = %file, error = %reason, "plugin failed to load");
                state.load_errors.insert(file, reason);
                continue;
            }
            if let Some(existing) = state.plugins.get(&spec.name) {
                let reason = format!(
                    "tool name '{}' is already loaded from {}",
                    spec.name, existing.file
                );
                tracing::warn!(file = %file, error = %reason, "plugin failed to load");
                state.load_errors.insert(file, reason);
                continue;
            }
            let path = self.plugin_dir.join(&file);
            tracing::debug!(tool = %spec.name, file = %file, "plugin loaded");
            state
                .plugins
                .insert(spec.name.clone(), LoadedPlugin { spec, file, path });
        }

        state.snapshot = fresh;
        state.last_scan_at = Some(Utc::now());
        if snapshot_changed || force {
            state.selections.clear();
        }
        let changed = state.membership() != before;
        if changed {
            tracing::info!(
                loaded = state.plugins.len(),
                errors = state.load_errors.len(),
                "plugin registry changed"
            );
        }
        Ok(changed)
    }

    async fn probe(&self, file: &str) -> Result<ToolSpecification, String> {
        let path = self.plugin_dir.join(file);
        let (program, mut args) = plugin_command(&path);
        args.push("--describe".into());
        let spec = ProcessSpec {
            program,
            args,
            cwd: self.workdir.clone(),
            env: self.sandbox.plugin_policy(false).env_vars(),
            timeout: self.probe_timeout,
        };
        let output = run_process(spec).await.map_err(|err| match err {
            ToolError::Timeout(secs) => format!("describe timed out after {secs}s"),
            other => other.to_string(),
        })?;
        if !output.success() {
            let detail = output.stderr.trim();
            return Err(format!(
                "describe exited with {}{}",
                output.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                if detail.is_empty() { String::new() } else { format!(": {detail}") }
            ));
        }
        let value = parse_json_output(&output.stdout)
            .ok_or_else(|| "describe output is not valid JSON".to_string())?;
        parse_spec(value, file)
    }

    /// Built-ins and loaded plugins, sorted by name.
    pub fn describe(&self) -> Vec<ToolSpecification> {
        let state = self.state();
        let mut all: Vec<ToolSpecification> = self
            .builtins
            .values()
            .cloned()
            .chain(state.plugins.values().map(|p| p.spec.clone()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn plugin(&self, name: &str) -> Option<LoadedPlugin> {
        self.state().plugins.get(name).cloned()
    }

    pub fn plugins(&self) -> Vec<LoadedPlugin> {
        self.state().plugins.values().cloned().collect()
    }

    /// Plugins loaded from `file`, a bare file name inside the plugin directory.
    pub fn plugins_in_file(&self, file: &str) -> Vec<LoadedPlugin> {
        self.state()
            .plugins
            .values()
            .filter(|p| p.file == file)
            .cloned()
            .collect()
    }

    /// Map a workdir-relative or absolute path to a file name in the plugin directory.
    pub fn plugin_file_name(&self, path: &str) -> Option<String> {
        let raw = Path::new(path);
        if raw.components().count() == 1 {
            return Some(path.to_string());
        }
        let abs = if raw.is_absolute() {
            normalize(raw)
        } else {
            normalize(&self.workdir.join(raw))
        };
        if abs.parent()? != self.plugin_dir {
            return None;
        }
        abs.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    pub fn load_errors(&self) -> BTreeMap<String, String> {
        self.state().load_errors.clone()
    }

    pub fn snapshot_hash(&self) -> String {
        self.state().snapshot.hash()
    }

    pub fn status(&self) -> RegistryStatus {
        let state = self.state();
        RegistryStatus {
            plugin_dir: self.plugin_dir.clone(),
            loaded: state
                .plugins
                .values()
                .map(|p| PluginSummary {
                    name: p.spec.name.clone(),
                    file: p.file.clone(),
                    version: p.spec.version.clone(),
                    network_access: p.spec.network_access,
                })
                .collect(),
            load_errors: state.load_errors.clone(),
            last_scan_at: state.last_scan_at,
            cached_selections: state.selections.len(),
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
        }
    }

    /// Tools relevant to `intent`, memoized per registry snapshot.
    pub fn select_for_intent(&self, intent: &str, strict: bool) -> (Vec<ToolSpecification>, SelectionReport) {
        let catalog = self.describe();
        let mut state = self.state();
        let key = cache_key(intent, &state.snapshot.hash(), strict);
        let (names, hit) = match state.selections.get(&key) {
            Some(names) => (names.clone(), true),
            None => {
                let names: Vec<String> = select_tool_names(intent, &catalog, strict).into_iter().collect();
                state.selections.insert(key.clone(), names.clone());
                (names, false)
            }
        };
        if hit {
            state.cache_hits += 1;
        } else {
            state.cache_misses += 1;
        }
        drop(state);

        let selected: Vec<ToolSpecification> = catalog
            .iter()
            .filter(|s| names.contains(&s.name))
            .cloned()
            .collect();
        let report = SelectionReport {
            cache_key: key,
            cache_hit: hit,
            selected: selected.iter().map(|s| s.name.clone()).collect(),
            available: catalog.len(),
        };
        (selected, report)
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
