//! Query history sources

use super::{DigestError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One captured statement and how often it ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryObservation {
    pub query_text: String,
    #[serde(default = "default_execution_count")]
    pub execution_count: u64,
    #[serde(default)]
    pub last_execution_time: Option<Timestamp>,
}

fn default_execution_count() -> u64 {
    1
}

impl QueryObservation {
    pub fn new(query_text: impl Into<String>, execution_count: u64) -> Self {
        Self {
            query_text: query_text.into(),
            execution_count,
            last_execution_time: None,
        }
    }

    pub fn at(mut self, time: Timestamp) -> Self {
        self.last_execution_time = Some(time);
        self
    }
}

/// Supplies historical query statistics
pub trait QueryHistorySource: Send + Sync {
    /// Observations since `since`, most executed first, at most `limit`
    fn fetch(&self, since: Timestamp, limit: usize) -> Result<Vec<QueryObservation>, DigestError>;
}

/// Apply the window, ordering and cap shared by every source
fn select_recent(
    observations: impl IntoIterator<Item = QueryObservation>,
    since: Timestamp,
    limit: usize,
) -> Vec<QueryObservation> {
    let mut recent: Vec<_> = observations
        .into_iter()
        .filter(|obs| obs.last_execution_time.map_or(true, |time| time >= since))
        .collect();
    recent.sort_by(|a, b| b.execution_count.cmp(&a.execution_count));
    recent.truncate(limit);
    recent
}

/// In-memory history
#[derive(Debug, Clone, Default)]
pub struct StaticHistory {
    observations: Vec<QueryObservation>,
}

impl StaticHistory {
    pub fn new(observations: Vec<QueryObservation>) -> Self {
        Self { observations }
    }
}

impl QueryHistorySource for StaticHistory {
    fn fetch(&self, since: Timestamp, limit: usize) -> Result<Vec<QueryObservation>, DigestError> {
        Ok(select_recent(self.observations.iter().cloned(), since, limit))
    }
}

/// Newline-delimited JSON log of executed statements.
///
/// Each line is a [`QueryObservation`]. Lines with the same text are folded
/// together when read: counts are summed and the latest time kept.
pub struct JsonLinesHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one executed statement
    pub fn record(&self, query: &str, at: Timestamp) -> Result<(), DigestError> {
        let line = serde_json::to_string(&QueryObservation::new(query, 1).at(at))?;
        let write_err = |source| DigestError::Write {
            path: self.path.clone(),
            source,
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        writeln!(file, "{line}").map_err(write_err)?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<QueryObservation>, DigestError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let read_err = |source| DigestError::Read {
            path: self.path.clone(),
            source,
        };
        let file = std::fs::File::open(&self.path).map_err(read_err)?;

        let mut folded: HashMap<String, QueryObservation> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).map_err(read_err)? == 0 {
                break;
            }
            line_no += 1;

            let Ok(line) = std::str::from_utf8(&buf) else {
                tracing::warn!("Skipping history line {} that is not UTF-8", line_no);
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            let obs: QueryObservation = match serde_json::from_str(line) {
                Ok(obs) => obs,
                Err(e) => {
                    tracing::warn!("Skipping malformed history line {}: {}", line_no, e);
                    continue;
                }
            };

            match folded.get_mut(&obs.query_text) {
                Some(existing) => {
                    existing.execution_count += obs.execution_count;
                    existing.last_execution_time =
                        existing.last_execution_time.max(obs.last_execution_time);
                }
                None => {
                    order.push(obs.query_text.clone());
                    folded.insert(obs.query_text.clone(), obs);
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|text| folded.remove(&text))
            .collect())
    }
}

impl QueryHistorySource for JsonLinesHistory {
    fn fetch(&self, since: Timestamp, limit: usize) -> Result<Vec<QueryObservation>, DigestError> {
        let observations = self.read_all()?;
        tracing::debug!(
            "Read {} distinct statements from {:?}",
            observations.len(),
            self.path
        );
        Ok(select_recent(observations, since, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn day(d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_static_history_window_and_order() {
        let history = StaticHistory::new(vec![
            QueryObservation::new("SELECT * FROM old_table", 50).at(day(1)),
            QueryObservation::new("SELECT * FROM a", 2).at(day(20)),
            QueryObservation::new("SELECT * FROM b", 9).at(day(21)),
            QueryObservation::new("SELECT * FROM undated", 4),
        ]);

        let fetched = history.fetch(day(10), 10).unwrap();
        let texts: Vec<_> = fetched.iter().map(|o| o.query_text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["SELECT * FROM b", "SELECT * FROM undated", "SELECT * FROM a"]
        );

        assert_eq!(history.fetch(day(10), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_jsonl_record_and_fold() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonLinesHistory::new(dir.path().join("logs").join("history.jsonl"));

        history.record("SELECT * FROM t", day(2)).unwrap();
        history.record("SELECT * FROM t", day(3)).unwrap();
        history.record("SELECT * FROM u", day(3)).unwrap();

        let fetched = history.fetch(day(1), 100).unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].query_text, "SELECT * FROM t");
        assert_eq!(fetched[0].execution_count, 2);
        assert_eq!(fetched[0].last_execution_time, Some(day(3)));
    }

    #[test]
    fn test_jsonl_skips_lines_that_are_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let mut content = b"{\"query_text\": \"SELECT a FROM t\"}\n".to_vec();
        content.extend_from_slice(b"\xff\xfe garbage\n");
        content.extend_from_slice(b"{\"query_text\": \"SELECT b FROM t\"}\n");
        std::fs::write(&path, content).unwrap();

        let history = JsonLinesHistory::new(&path);
        let fetched = history.fetch(day(1) - Duration::days(365), 100).unwrap();
        let texts: Vec<_> = fetched.iter().map(|o| o.query_text.as_str()).collect();
        assert_eq!(texts, vec!["SELECT a FROM t", "SELECT b FROM t"]);
    }

    #[test]
    fn test_jsonl_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(
            &path,
            "{\"query_text\": \"SELECT 1 FROM t\", \"execution_count\": 3}\nnot json\n\n{\"query_text\": \"SELECT 2 FROM t\"}\n",
        )
        .unwrap();

        let history = JsonLinesHistory::new(&path);
        let fetched = history.fetch(day(1) - Duration::days(365), 100).unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].execution_count, 3);
        assert_eq!(fetched[1].execution_count, 1);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonLinesHistory::new(dir.path().join("nothing.jsonl"));
        assert!(history.fetch(day(1), 10).unwrap().is_empty());
    }
}
