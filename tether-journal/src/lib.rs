use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
}

/// One record in an append-only, hash-chained JSONL journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: Uuid,
    pub timestamp: String,
    pub kind: String,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

pub struct Journal {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| JournalError::Io(e.to_string()))?;
        }
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, kind: &str, payload: Value) -> Result<JournalEntry, JournalError> {
        let mut last = self.last_hash.lock().map_err(|_| JournalError::Io("lock".into()))?;
        let mut entry = JournalEntry {
            entry_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            payload,
            prev_hash: last.clone(),
            chain_hash: String::new(),
        };
        entry.chain_hash = hash_entry(&entry);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| JournalError::Io(e.to_string()))?;
        let line = serde_json::to_string(&entry).map_err(|e| JournalError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| JournalError::Io(e.to_string()))?;
        *last = Some(entry.chain_hash.clone());
        Ok(entry)
    }
}

/// Walk the chain and fail on the first broken link. Returns the entry count.
pub fn verify_journal(path: impl AsRef<Path>) -> Result<usize, JournalError> {
    let mut prev: Option<String> = None;
    let mut count = 0;
    for (idx, entry) in read_entries(path.as_ref())?.into_iter().enumerate() {
        let line = idx + 1;
        if entry.prev_hash != prev {
            return Err(JournalError::Chain {
                line,
                reason: "prev hash mismatch".into(),
            });
        }
        if entry.chain_hash != hash_entry(&entry) {
            return Err(JournalError::Chain {
                line,
                reason: "chain hash invalid".into(),
            });
        }
        prev = Some(entry.chain_hash);
        count += 1;
    }
    Ok(count)
}

/// Last `n` entries, oldest first.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<JournalEntry>, JournalError> {
    let mut entries = read_entries(path.as_ref())?;
    let start = entries.len().saturating_sub(n);
    Ok(entries.split_off(start))
}

pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>, JournalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| JournalError::Io(e.to_string()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| JournalError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line).map_err(|e| JournalError::Parse(e.to_string()))?);
    }
    Ok(out)
}

fn hash_entry(entry: &JournalEntry) -> String {
    let mut h = Sha256::new();
    h.update(entry.entry_id.to_string());
    h.update(&entry.timestamp);
    h.update(&entry.kind);
    h.update(entry.payload.to_string());
    if let Some(prev) = &entry.prev_hash {
        h.update(prev);
    }
    format!("{:x}", h.finalize())
}

fn read_last_hash(path: &Path) -> Result<Option<String>, JournalError> {
    Ok(read_entries(path)?.pop().map(|e| e.chain_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn journal_chain_verifies_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/alerts.jsonl");
        let journal = Journal::open(&path).unwrap();
        journal.append("alert", json!({"restart_count": 4})).unwrap();
        drop(journal);

        let journal = Journal::open(&path).unwrap();
        let second = journal.append("alert", json!({"restart_count": 5})).unwrap();
        assert!(second.prev_hash.is_some());
        assert_eq!(verify_journal(&path).unwrap(), 2);

        let last = tail(&path, 1).unwrap();
        assert_eq!(last[0].payload["restart_count"], 5);
    }

    #[test]
    fn tampered_payload_breaks_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&path).unwrap();
        journal.append("policy_decision", json!({"tool": "run_shell", "decision": "deny"})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap().replace("deny", "allow");
        std::fs::write(&path, text).unwrap();
        let err = verify_journal(&path).unwrap_err();
        assert!(matches!(err, JournalError::Chain { line: 1, .. }));
    }
}
