//! Persisted consumer and stream-task records.
//!
//! The store is one JSON document. [`MetaStore::save`] writes it to a
//! temporary sibling file and renames it into place, so a reader sees either
//! the old or the new document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetaStoreError, Result};
use crate::tq::exec::QueryPlan;
use crate::tq::stream::TaskDescriptor;

/// A subscription's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    /// Subscription key.
    pub sub_key: String,
    /// Consumer holding the subscription.
    pub consumer_id: i64,
    /// Epoch at the time of the commit.
    pub epoch: i32,
    /// What the subscription reads.
    pub plan: QueryPlan,
}

/// A deployed task's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// The descriptor the task was deployed from.
    pub descriptor: TaskDescriptor,
    /// Runner count.
    pub parallelism: usize,
}

/// Everything the log layer persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TqMeta {
    /// Subscriptions, sorted by key.
    #[serde(default)]
    pub consumers: Vec<ConsumerRecord>,
    /// Stream tasks, sorted by id.
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// JSON file holding a [`TqMeta`].
#[derive(Debug, Clone)]
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    /// Store backed by `path`. Nothing is read until [`Self::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the records, or an empty set if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`MetaStoreError::Load`] or [`MetaStoreError::Parse`] if the
    /// file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<TqMeta> {
        if !self.path.exists() {
            return Ok(TqMeta::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|source| MetaStoreError::Load {
            path: self.path.clone(),
            source,
        })?;
        let meta: TqMeta = serde_json::from_str(&data).map_err(|source| MetaStoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            target: "tessel::tq",
            path = %self.path.display(),
            consumers = meta.consumers.len(),
            tasks = meta.tasks.len(),
            "meta loaded"
        );
        Ok(meta)
    }

    /// Replaces the stored records with `meta`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaStoreError::Serialize`] or [`MetaStoreError::Save`].
    pub fn save(&self, meta: &TqMeta) -> Result<()> {
        let data = serde_json::to_string_pretty(meta)
            .map_err(|source| MetaStoreError::Serialize { source })?;
        let tmp = self.path.with_extension("json.tmp");
        let save_err = |source| MetaStoreError::Save {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&tmp, data).map_err(save_err)?;
        std::fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            save_err(source)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tq::stream::SinkKind;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path().join("tq.json"));
        assert_eq!(store.load().unwrap(), TqMeta::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path().join("tq.json"));
        let meta = TqMeta {
            consumers: vec![ConsumerRecord {
                sub_key: "cg:t".to_string(),
                consumer_id: 5,
                epoch: 2,
                plan: QueryPlan {
                    tables: vec![1, 2],
                    ..QueryPlan::default()
                },
            }],
            tasks: vec![TaskRecord {
                descriptor: TaskDescriptor {
                    task_id: 3,
                    plan: None,
                    sink: SinkKind::Aggregation,
                },
                parallelism: 2,
            }],
        };
        store.save(&meta).unwrap();
        assert!(!dir.path().join("tq.json.tmp").exists());
        assert_eq!(store.load().unwrap(), meta);
    }

    #[test]
    fn test_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tq.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(MetaStore::new(path).load().is_err());
    }
}
