//! Append-only ledger of denied accesses.
//!
//! Entries live in a bounded in-memory ring (oldest evicted first). When a
//! log path is configured every entry is also appended to a JSONL file, one
//! object per line. Persistence is best-effort: a failed write is logged and
//! the in-memory record still succeeds.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::error::Result;
use super::policy::FsOp;

pub const DEFAULT_VIOLATION_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    FsRead,
    FsWrite,
    Network,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::FsRead => "fs-read",
            ViolationKind::FsWrite => "fs-write",
            ViolationKind::Network => "network",
        }
    }
}

impl From<FsOp> for ViolationKind {
    fn from(op: FsOp) -> Self {
        match op {
            FsOp::Read => ViolationKind::FsRead,
            FsOp::Write => ViolationKind::FsWrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub kind: ViolationKind,
    /// Path for filesystem denials, host for network denials.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ViolationEntry {
    pub fn new(
        kind: ViolationKind,
        resource: impl Into<String>,
        task_id: Option<&str>,
        command: Option<&str>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.map(str::to_string),
            kind,
            resource: resource.into(),
            command: command.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct ViolationStore {
    entries: Mutex<VecDeque<ViolationEntry>>,
    capacity: usize,
    log_path: Option<PathBuf>,
}

impl Default for ViolationStore {
    fn default() -> Self {
        Self::new(DEFAULT_VIOLATION_CAPACITY)
    }
}

impl ViolationStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            log_path: None,
        }
    }

    /// Also append every entry to `path` as JSONL.
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ViolationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a denial. Never fails.
    pub fn record(&self, entry: ViolationEntry) {
        debug!(
            kind = entry.kind.as_str(),
            resource = %entry.resource,
            task = entry.task_id.as_deref().unwrap_or("-"),
            "sandbox violation"
        );

        if let Some(path) = &self.log_path
            && let Err(e) = append_line(path, &entry)
        {
            warn!("Failed to persist violation to {}: {}", path.display(), e);
        }

        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest first, optionally restricted to one task.
    pub fn list(&self, task_id: Option<&str>) -> Vec<ViolationEntry> {
        self.lock()
            .iter()
            .filter(|e| task_id.is_none() || e.task_id.as_deref() == task_id)
            .cloned()
            .collect()
    }

    /// Remove entries (all, or one task's). Returns how many were removed.
    /// The on-disk log is not rewritten.
    pub fn clear(&self, task_id: Option<&str>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        match task_id {
            None => entries.clear(),
            Some(task) => entries.retain(|e| e.task_id.as_deref() != Some(task)),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn append_line(path: &Path, entry: &ViolationEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read a persisted violation log. Corrupted lines are skipped; a missing
/// file yields an empty list.
pub fn read_log(path: &Path) -> Result<Vec<ViolationEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<ViolationEntry>(line).ok())
        .collect())
}

static DENIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:'([^'\n]+)'|(?:^|\s)(/[^:'\n]+)): (?:Permission denied|Operation not permitted)")
        .expect("denial pattern is valid")
});

static WRITE_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"cannot (?:touch|create|remove|move|write|make)|Read-only|cannot open .* for writing")
        .expect("write hint pattern is valid")
});

/// A permission denial reported on a command's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedDenial {
    pub path: PathBuf,
    /// `Some(Write)` when the message names a mutating operation.
    pub hint: Option<FsOp>,
}

/// Pull absolute paths out of "Permission denied" style stderr lines.
pub fn parse_denials(stderr: &str) -> Vec<ReportedDenial> {
    let mut out: Vec<ReportedDenial> = Vec::new();
    for line in stderr.lines() {
        for caps in DENIAL_RE.captures_iter(line) {
            let Some(raw) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let path = PathBuf::from(raw.as_str().trim());
            if !path.is_absolute() {
                continue;
            }
            let hint = WRITE_HINT_RE.is_match(line).then_some(FsOp::Write);
            if !out.iter().any(|d| d.path == path) {
                out.push(ReportedDenial { path, hint });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(task: &str, resource: &str) -> ViolationEntry {
        ViolationEntry::new(ViolationKind::Network, resource, Some(task), Some("curl x"))
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let store = ViolationStore::new(2);
        store.record(entry("a", "one.com"));
        store.record(entry("a", "two.com"));
        store.record(entry("a", "three.com"));

        let resources: Vec<String> = store.list(None).into_iter().map(|e| e.resource).collect();
        assert_eq!(resources, vec!["two.com", "three.com"]);
    }

    #[test]
    fn test_list_and_clear_by_task() {
        let store = ViolationStore::default();
        store.record(entry("a", "one.com"));
        store.record(entry("b", "two.com"));
        store.record(entry("a", "three.com"));

        assert_eq!(store.list(Some("a")).len(), 2);
        assert_eq!(store.list(Some("b")).len(), 1);
        assert_eq!(store.clear(Some("a")), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(None), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_log_round_trip_skips_corrupt_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("violations.jsonl");
        let store = ViolationStore::new(10).with_log(&path);

        store.record(entry("a", "one.com"));
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{not json"))
            .unwrap();
        store.record(entry("b", "two.com"));

        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].resource, "one.com");
        assert_eq!(entries[1].task_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_record_survives_unwritable_log() {
        let tmp = TempDir::new().unwrap();
        // A directory where the log file should be.
        let store = ViolationStore::new(10).with_log(tmp.path());
        store.record(entry("a", "one.com"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_log(&tmp.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ViolationKind::FsWrite).unwrap();
        assert_eq!(json, "\"fs-write\"");
    }

    #[test]
    fn test_parse_denials() {
        let stderr = "\
touch: cannot touch '/etc/shellfence-test': Permission denied
cat: /home/user/.ssh/id_ed25519: Permission denied
bash: /usr/local/bin/x: Operation not permitted
grep: relative/path: Permission denied
ls: cannot access '/nope': No such file or directory
";
        let denials = parse_denials(stderr);
        assert_eq!(denials.len(), 3);
        assert_eq!(denials[0].path, PathBuf::from("/etc/shellfence-test"));
        assert_eq!(denials[0].hint, Some(FsOp::Write));
        assert_eq!(denials[1].path, PathBuf::from("/home/user/.ssh/id_ed25519"));
        assert_eq!(denials[1].hint, None);
        assert_eq!(denials[2].path, PathBuf::from("/usr/local/bin/x"));
    }
}
