use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    claims::ClaimRecord,
    common::{delete_if_exists, ensure_parent_dir, tmp_path_for, truncate_for_log},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub claim_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingEntry {
    /// Rebuilds the claim from the stored payload, falling back to a bare id
    /// when the payload predates the current record layout.
    pub fn to_claim(&self) -> ClaimRecord {
        serde_json::from_value::<ClaimRecord>(self.payload.clone())
            .ok()
            .filter(|claim| claim.claim_id == self.claim_id)
            .unwrap_or_else(|| ClaimRecord {
                claim_id: self.claim_id.clone(),
                date: None,
                cause: String::new(),
                insurer: String::new(),
            })
    }
}

/// Claims still waiting for a conclusive lookup, keyed by claim id.
///
/// Loaded fully at run start, mutated in memory, and written back in one
/// temp-file-then-rename step at run end.
#[derive(Debug)]
pub struct PendingQueue {
    path: PathBuf,
    entries: BTreeMap<String, PendingEntry>,
}

impl PendingQueue {
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("Failed opening pending queue {}", path.display()))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.with_context(|| {
                    format!("Failed reading line {} of {}", idx + 1, path.display())
                })?;
                let trimmed = line.trim_start_matches('\u{feff}').trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<PendingEntry>(trimmed) {
                    Ok(entry) if !entry.claim_id.trim().is_empty() => {
                        entries.insert(entry.claim_id.clone(), entry);
                    }
                    Ok(_) => {
                        tracing::warn!(line = idx + 1, "Ignoring pending entry without claim id");
                    }
                    Err(err) => {
                        tracing::warn!(
                            line = idx + 1,
                            content = %truncate_for_log(trimmed),
                            "Ignoring malformed pending entry: {err}"
                        );
                    }
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, claim_id: &str) -> bool {
        self.entries.contains_key(claim_id)
    }

    pub fn get(&self, claim_id: &str) -> Option<&PendingEntry> {
        self.entries.get(claim_id)
    }

    pub fn claims(&self) -> Vec<ClaimRecord> {
        self.entries.values().map(PendingEntry::to_claim).collect()
    }

    /// Keeps `claim` pending for the next run, counting the failed attempt.
    pub fn requeue(&mut self, claim: &ClaimRecord) -> Result<()> {
        let payload = serde_json::to_value(claim)
            .with_context(|| format!("Failed serializing claim {}", claim.claim_id))?;
        let entry = self
            .entries
            .entry(claim.claim_id.clone())
            .or_insert_with(|| PendingEntry {
                claim_id: claim.claim_id.clone(),
                payload: serde_json::Value::Null,
                attempts: 0,
            });
        entry.payload = payload;
        entry.attempts += 1;
        Ok(())
    }

    /// Drops a claim that reached a conclusive outcome.
    pub fn resolve(&mut self, claim_id: &str) -> bool {
        self.entries.remove(claim_id).is_some()
    }

    /// Rewrites the queue file; an empty queue removes it.
    pub fn save(&self) -> Result<()> {
        if self.is_empty() {
            return delete_if_exists(&self.path);
        }
        ensure_parent_dir(&self.path)?;
        let tmp_path = tmp_path_for(&self.path, "pending_claims.jsonl");

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        for entry in self.entries.values() {
            serde_json::to_writer(&mut writer, entry)
                .with_context(|| format!("Failed serializing pending claim {}", entry.claim_id))?;
            writer
                .write_all(b"\n")
                .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
        }
        writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all())
            .with_context(|| format!("Failed flushing {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed moving temp pending queue {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn claim(id: &str) -> ClaimRecord {
        ClaimRecord {
            claim_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1),
            cause: "agua".to_string(),
            insurer: "Allianz".to_string(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::load(&dir.path().join("pending.jsonl")).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_counts_attempts_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("pending.jsonl");

        let mut queue = PendingQueue::load(&path).unwrap();
        queue.requeue(&claim("657356095")).unwrap();
        queue.requeue(&claim("657356095")).unwrap();
        queue.requeue(&claim("700000001")).unwrap();
        queue.save().unwrap();
        assert!(!path.with_file_name("pending.jsonl.tmp").exists());

        let reloaded = PendingQueue::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("657356095").unwrap().attempts, 2);
        assert_eq!(reloaded.claims()[0], claim("657356095"));
    }

    #[test]
    fn resolving_everything_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.jsonl");
        let mut queue = PendingQueue::load(&path).unwrap();
        queue.requeue(&claim("657356095")).unwrap();
        queue.save().unwrap();
        assert!(path.exists());

        let mut queue = PendingQueue::load(&path).unwrap();
        assert!(queue.resolve("657356095"));
        assert!(!queue.resolve("657356095"));
        queue.save().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn tolerates_bom_blank_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.jsonl");
        fs::write(
            &path,
            "\u{feff}{\"claim_id\":\"657356095\",\"payload\":{\"claim_id\":\"657356095\",\"cause\":\"agua\"}}\n\
             \n\
             not json\n\
             {\"claim_id\":\"\"}\n\
             {\"claim_id\":\"700000001\"}\n",
        )
        .unwrap();

        let queue = PendingQueue::load(&path).unwrap();
        assert_eq!(queue.len(), 2);
        let claims = queue.claims();
        assert_eq!(claims[0].cause, "agua");
        assert_eq!(claims[0].date, None);
        assert_eq!(claims[1].claim_id, "700000001");
        assert_eq!(queue.get("700000001").unwrap().attempts, 0);
    }

    #[test]
    fn payload_for_another_claim_falls_back_to_bare_id() {
        let entry = PendingEntry {
            claim_id: "657356095".to_string(),
            payload: serde_json::json!({"claim_id": "111111111", "cause": "x"}),
            attempts: 1,
        };
        let claim = entry.to_claim();
        assert_eq!(claim.claim_id, "657356095");
        assert_eq!(claim.cause, "");
    }
}
