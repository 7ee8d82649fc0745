//! Filesystem store backend.
//!
//! One `NCTnnnnnnnn.json` per record under `{root}/data/`. Writes land in a
//! temporary file first and are renamed over the final path, so a reader
//! sees either the previous record or the new one, never a torn write.
//! Directory entries that do not parse as NCT ids are ignored on listing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ctgov2fhir_core::{ClinicalStudy, NctId};
use tracing::{debug, warn};

use crate::{decode_record, encode_record, StoreError, StoreStat, StudyStore};

pub struct FsStore {
    data_dir: PathBuf,
    max_entry_size: usize,
    tmp_counter: AtomicU64,
}

impl FsStore {
    /// Open the store rooted at `root`, creating `{root}/data/` (and any
    /// missing parents) if absent.
    pub async fn open(root: impl Into<PathBuf>, max_entry_size: usize) -> Result<Self, StoreError> {
        let data_dir = root.into().join("data");
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: data_dir.clone(),
                source,
            })?;
        debug!(target: "ctgovservice", dir = %data_dir.display(), "opened filesystem store");
        Ok(Self {
            data_dir,
            max_entry_size,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn record_path(&self, nct_id: NctId) -> PathBuf {
        self.data_dir.join(format!("{nct_id}.json"))
    }

    fn tmp_path(&self, nct_id: NctId) -> PathBuf {
        let serial = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.data_dir.join(format!(".{nct_id}.{serial}.tmp"))
    }

    /// Write the serialized record to a fresh temporary file.
    async fn stage(&self, nct_id: NctId, study: &ClinicalStudy) -> Result<Staged, StoreError> {
        let json = encode_record(nct_id, study, self.max_entry_size)?;
        let tmp = self.tmp_path(nct_id);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        Ok(Staged {
            tmp,
            target: self.record_path(nct_id),
        })
    }

    async fn publish(&self, staged: Staged) -> Result<(), StoreError> {
        tokio::fs::rename(&staged.tmp, &staged.target)
            .await
            .map_err(|source| StoreError::Io {
                path: staged.target.clone(),
                source,
            })
    }

    async fn discard(&self, staged: &[Staged]) {
        for stage in staged {
            if let Err(error) = tokio::fs::remove_file(&stage.tmp).await {
                warn!(
                    target: "ctgovservice",
                    path = %stage.tmp.display(),
                    %error,
                    "failed to clean up staged record"
                );
            }
        }
    }
}

struct Staged {
    tmp: PathBuf,
    target: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl StudyStore for FsStore {
    async fn put(&self, nct_id: NctId, study: &ClinicalStudy) -> Result<(), StoreError> {
        let staged = self.stage(nct_id, study).await?;
        self.publish(staged).await
    }

    async fn put_batch(&self, records: &[(NctId, ClinicalStudy)]) -> Result<(), StoreError> {
        // Stage everything before the first rename so a failure mid-batch
        // leaves no new record visible.
        let mut staged = Vec::with_capacity(records.len());
        for (nct_id, study) in records {
            match self.stage(*nct_id, study).await {
                Ok(stage) => staged.push(stage),
                Err(error) => {
                    self.discard(&staged).await;
                    return Err(error);
                }
            }
        }
        for stage in staged {
            self.publish(stage).await?;
        }
        Ok(())
    }

    async fn get(&self, nct_id: NctId) -> Result<Option<ClinicalStudy>, StoreError> {
        let path = self.record_path(nct_id);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(&path, error)),
        };
        if metadata.len() > self.max_entry_size as u64 {
            return Err(StoreError::TooLarge {
                nct_id,
                size: metadata.len() as usize,
                limit: self.max_entry_size,
            });
        }
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(&path, error)),
        };
        decode_record(nct_id, &json).map(Some)
    }

    async fn delete(&self, nct_id: NctId) -> Result<(), StoreError> {
        let path = self.record_path(nct_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_error(&path, error)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<NctId>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|source| io_error(&self.data_dir, source))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.data_dir, source))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(nct_id) = stem.parse::<NctId>() {
                keys.push(nct_id);
            }
        }
        Ok(keys)
    }

    async fn stat(&self, nct_id: NctId) -> Result<Option<StoreStat>, StoreError> {
        let path = self.record_path(nct_id);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(&path, error)),
        };
        let modified = metadata.modified().map_err(|source| io_error(&path, source))?;
        // Not every filesystem records a birth time; fall back to mtime.
        let created = metadata.created().unwrap_or(modified);
        Ok(Some(StoreStat {
            created_at: created,
            last_modified_at: modified,
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl std::fmt::Debug for FsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStore")
            .field("data_dir", &self.data_dir)
            .field("max_entry_size", &self.max_entry_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sample_study;
    use crate::DEFAULT_MAX_ENTRY_SIZE;

    async fn open_temp(dir: &tempfile::TempDir) -> FsStore {
        FsStore::open(dir.path(), DEFAULT_MAX_ENTRY_SIZE).await.unwrap()
    }

    #[tokio::test]
    async fn creates_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open_temp(&dir).await;
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let id: NctId = "NCT02513394".parse().unwrap();
        let study = sample_study(id);

        store.put(id, &study).await.unwrap();
        assert!(dir.path().join("data").join("NCT02513394.json").is_file());
        assert_eq!(store.get(id).await.unwrap(), Some(study));
    }

    #[tokio::test]
    async fn get_unknown_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let id: NctId = "NCT00000001".parse().unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.stat(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let id: NctId = "NCT00000042".parse().unwrap();
        store.put(id, &sample_study(id)).await.unwrap();

        let data = dir.path().join("data");
        std::fs::write(data.join("README.txt"), "not a record").unwrap();
        std::fs::write(data.join("NCT123.json"), "{}").unwrap();
        std::fs::write(data.join("nct00000001.json"), "{}").unwrap();

        assert_eq!(store.list_keys().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path(), 64).await.unwrap();
        let small: NctId = "NCT00000001".parse().unwrap();
        let big: NctId = "NCT00000002".parse().unwrap();
        let mut oversized = ClinicalStudy::default();
        oversized.extra.insert(
            "padding".into(),
            serde_json::Value::String("x".repeat(256)),
        );

        let records = vec![(small, ClinicalStudy::default()), (big, oversized)];
        let err = store.put_batch(&records).await.unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { .. }));
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let id: NctId = "NCT00000003".parse().unwrap();
        store.put(id, &sample_study(id)).await.unwrap();
        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path(), 16).await.unwrap();
        let id: NctId = "NCT00000008".parse().unwrap();
        std::fs::write(
            dir.path().join("data").join("NCT00000008.json"),
            "x".repeat(64),
        )
        .unwrap();
        assert!(matches!(
            store.get(id).await.unwrap_err(),
            StoreError::TooLarge { .. }
        ));
    }

    #[tokio::test]
    async fn stat_reports_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let id: NctId = "NCT00000006".parse().unwrap();
        store.put(id, &sample_study(id)).await.unwrap();
        let stat = store.stat(id).await.unwrap().unwrap();
        assert!(stat.last_modified_at >= stat.created_at);
    }
}
