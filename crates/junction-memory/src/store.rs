// Pattern Memory Store
// On-disk persistence for execution patterns and the history log

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{ExecutionHistory, ExecutionPattern, MemoryError, PatternMemory, PatternQuery, Result};

/// File-backed pattern memory.
///
/// Layout under the base directory:
///   patterns/<pattern_id>.json   one file per recorded pattern
///   history.log                  append-only JSONL of finished orchestrations
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir.join("patterns"))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn pattern_path(&self, pattern_id: &str) -> PathBuf {
        self.base_dir
            .join("patterns")
            .join(format!("{}.json", pattern_id))
    }

    fn history_path(&self) -> PathBuf {
        self.base_dir.join("history.log")
    }

    fn load_patterns(&self) -> Result<Vec<ExecutionPattern>> {
        let dir = self.base_dir.join("patterns");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut patterns = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<ExecutionPattern>(&content) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => {
                    // A corrupt pattern file must not poison lookup for the rest.
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable pattern file");
                }
            }
        }
        Ok(patterns)
    }

    /// Full history log, oldest first. Unparseable lines are skipped.
    pub fn load_history(&self) -> Result<Vec<ExecutionHistory>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Ok(entry) = serde_json::from_str(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl PatternMemory for FileStore {
    async fn store_pattern(&self, pattern: &ExecutionPattern) -> Result<()> {
        let path = self.pattern_path(&pattern.pattern_id);
        let content = serde_json::to_string_pretty(pattern)?;
        atomic_write(&path, &content)
    }

    async fn store_history(&self, history: &ExecutionHistory) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        let line = serde_json::to_string(history)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    async fn find_similar_patterns(
        &self,
        query: &PatternQuery,
        limit: usize,
    ) -> Result<Vec<ExecutionPattern>> {
        let mut scored: Vec<(usize, usize, ExecutionPattern)> = self
            .load_patterns()?
            .into_iter()
            .map(|pattern| {
                let shared = pattern
                    .targets
                    .iter()
                    .filter(|t| query.targets.contains(t))
                    .count();
                let step_distance = pattern.step_count.abs_diff(query.step_count);
                (shared, step_distance, pattern)
            })
            .collect();

        // Most shared targets first, then closest step count.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, pattern)| pattern)
            .collect())
    }
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)
        .map_err(|e| MemoryError::Store(format!("failed to rename temp file: {}", e)))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
