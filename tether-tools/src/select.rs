//! Keyword-table schema selection.

use std::collections::BTreeSet;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tether_types::ToolSpecification;

const ALWAYS: [&str; 3] = ["list_files", "read_file", "list_plugins"];

const FILE_WORDS: [&str; 10] = [
    "file", "files", "folder", "directory", "read", "write", "save", "note", "notes", "document",
];
const SHELL_WORDS: [&str; 6] = ["shell", "command", "terminal", "execute", "grep", "git"];
const CODE_WORDS: [&str; 6] = ["python", "script", "code", "calculate", "compute", "snippet"];
const SCHEDULE_WORDS: [&str; 10] = [
    "schedule",
    "scheduled",
    "daily",
    "every day",
    "every morning",
    "every evening",
    "reminder",
    "remind",
    "cron",
    "job",
];
const PLUGIN_ADMIN_WORDS: [&str; 7] = ["plugin", "plugins", "tool", "tools", "new tool", "delete tool", "reload"];
const REGISTRY_WORDS: [&str; 4] = ["registry", "status", "loaded", "broken"];
const WEB_WORDS: [&str; 9] = ["web", "http", "url", "website", "search", "news", "fetch", "download", "online"];

/// Why a selection came out the way it did.
#[derive(Clone, Debug, Serialize)]
pub struct SelectionReport {
    pub cache_key: String,
    pub cache_hit: bool,
    pub selected: Vec<String>,
    pub available: usize,
}

struct Intent {
    text: String,
    words: BTreeSet<String>,
}

impl Intent {
    fn new(raw: &str) -> Self {
        let text = normalize_intent(raw);
        let words = text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { text, words }
    }

    fn mentions(&self, word: &str) -> bool {
        let word = word.to_lowercase();
        if word.contains(' ') || word.contains('_') {
            self.text.contains(&word) || self.text.contains(&word.replace('_', " "))
        } else {
            self.words.contains(&word)
        }
    }

    fn any(&self, table: &[&str]) -> bool {
        table.iter().any(|w| self.mentions(w))
    }
}

/// Lowercased with whitespace collapsed.
pub fn normalize_intent(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Narrow `tools` to the subset relevant to `intent`.
pub fn select_tool_names(intent: &str, tools: &[ToolSpecification], strict: bool) -> BTreeSet<String> {
    let intent = Intent::new(intent);
    let mut wanted: BTreeSet<&str> = ALWAYS.into_iter().collect();
    let mut specific = false;

    if intent.any(&FILE_WORDS) {
        wanted.extend(["write_file", "save_plugin_file"]);
        specific = true;
    }
    if intent.any(&SHELL_WORDS) {
        wanted.insert("run_shell");
        specific = true;
    }
    if intent.any(&CODE_WORDS) && !strict {
        wanted.insert("run_code");
        specific = true;
    }
    if intent.any(&SCHEDULE_WORDS) {
        wanted.extend([
            "schedule_daily_tool",
            "list_scheduled_jobs",
            "delete_scheduled_job",
            "run_due_scheduled_jobs",
        ]);
        specific = true;
    }
    if intent.any(&PLUGIN_ADMIN_WORDS) {
        wanted.extend([
            "create_or_update_plugin_file",
            "delete_plugin_file",
            "reload_plugins",
            "save_plugin_file",
            "plugin_registry_status",
        ]);
        specific = true;
    }
    if intent.any(&REGISTRY_WORDS) {
        wanted.extend(["plugin_registry_status", "reload_plugins"]);
        specific = true;
    }
    let wants_web = intent.any(&WEB_WORDS);

    let mut selected: BTreeSet<String> = BTreeSet::new();
    let mut plugin_matched = false;
    for spec in tools {
        if spec.is_builtin() {
            if wanted.contains(spec.name.as_str()) {
                selected.insert(spec.name.clone());
            }
            continue;
        }
        let named = intent.mentions(&spec.name) || spec.keywords.iter().any(|k| intent.mentions(k));
        if named || (wants_web && spec.network_access) {
            selected.insert(spec.name.clone());
            plugin_matched = true;
        }
    }
    if !specific && !plugin_matched {
        selected.extend(tools.iter().filter(|s| !s.is_builtin()).map(|s| s.name.clone()));
    }
    if strict {
        selected.remove("run_code");
    }
    selected
}

/// Cache key over the normalized intent, the registry snapshot and the strict flag.
pub fn cache_key(intent: &str, snapshot_hash: &str, strict: bool) -> String {
    let mut h = Sha256::new();
    h.update(normalize_intent(intent).as_bytes());
    h.update(b"\n");
    h.update(snapshot_hash.as_bytes());
    h.update(b"\n");
    h.update(if strict { "strict" } else { "advisory" });
    hex::encode(h.finalize())
}
