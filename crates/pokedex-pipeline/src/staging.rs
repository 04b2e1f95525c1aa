//! Durable staging of detail documents
//!
//! One pretty-printed JSON file per entity, `<root>/<id>.json`. Writes go to
//! a unique temp file in the same directory and are renamed into place, so
//! a reader sees either the previous document or the new one, never a
//! partial file. Different ids never touch the same path.

use futures::stream::{self, BoxStream, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StagingError;
use crate::model::DetailRecord;

const DOCUMENT_EXTENSION: &str = "json";

/// Keyed store of staged detail documents
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

enum ListState {
    Start(PathBuf),
    Reading(PathBuf, fs::ReadDir),
    Done,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the document staged for `id`
    pub fn document_path(&self, id: i32) -> PathBuf {
        self.root.join(format!("{id}.{DOCUMENT_EXTENSION}"))
    }

    /// Stage `record` under `id`, replacing any earlier document for that id
    pub async fn put(&self, id: i32, record: &DetailRecord) -> Result<(), StagingError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StagingError::Io {
                path: self.root.clone(),
                source,
            })?;

        let body =
            serde_json::to_vec_pretty(record).map_err(|source| StagingError::Encode { id, source })?;

        let target = self.document_path(id);
        let temp = self
            .root
            .join(format!(".{id}.{}.tmp", Uuid::new_v4().simple()));

        if let Err(source) = write_synced(&temp, &body).await {
            discard(&temp).await;
            return Err(StagingError::Io { path: temp, source });
        }

        if let Err(source) = fs::rename(&temp, &target).await {
            discard(&temp).await;
            return Err(StagingError::Io {
                path: target,
                source,
            });
        }

        debug!(entity_id = id, path = %target.display(), bytes = body.len(), "Staged document");
        Ok(())
    }

    /// Read the document staged for `id`, if any
    pub async fn get(&self, id: i32) -> Result<Option<DetailRecord>, StagingError> {
        let path = self.document_path(id);
        match fs::read(&path).await {
            Ok(bytes) => decode(&path, id, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StagingError::Io { path, source }),
        }
    }

    /// Ids of all staged documents, ascending
    pub async fn ids(&self) -> Result<Vec<i32>, StagingError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StagingError::Io {
                    path: self.root.clone(),
                    source,
                })
            },
        };

        let mut ids = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => ids.extend(staged_id(&entry.path())),
                Ok(None) => break,
                Err(source) => {
                    return Err(StagingError::Io {
                        path: self.root.clone(),
                        source,
                    })
                },
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Lazily read every staged document
    ///
    /// Each call starts a fresh directory scan, so the stream reflects what
    /// is staged when it is polled. A missing directory yields nothing. Order
    /// is unspecified. A read error ends the stream after yielding it.
    pub fn list(&self) -> BoxStream<'static, Result<DetailRecord, StagingError>> {
        stream::unfold(ListState::Start(self.root.clone()), |state| async move {
            let (root, mut entries) = match state {
                ListState::Start(root) => match fs::read_dir(&root).await {
                    Ok(entries) => (root, entries),
                    Err(e) if e.kind() == ErrorKind::NotFound => return None,
                    Err(source) => {
                        let err = StagingError::Io { path: root, source };
                        return Some((Err(err), ListState::Done));
                    },
                },
                ListState::Reading(root, entries) => (root, entries),
                ListState::Done => return None,
            };

            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let Some(id) = staged_id(&path) else {
                            continue;
                        };
                        let item = read_document(&path, id).await;
                        let next = if item.is_ok() {
                            ListState::Reading(root, entries)
                        } else {
                            ListState::Done
                        };
                        return Some((item, next));
                    },
                    Ok(None) => return None,
                    Err(source) => {
                        let err = StagingError::Io { path: root, source };
                        return Some((Err(err), ListState::Done));
                    },
                }
            }
        })
        .boxed()
    }
}

/// Id encoded in a staged file name; temp files, foreign files and
/// non-canonical spellings like `05.json` or `+5.json` yield None
fn staged_id(path: &Path) -> Option<i32> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(DOCUMENT_EXTENSION)?.strip_suffix('.')?;
    let id: i32 = stem.parse().ok()?;
    (id.to_string() == stem).then_some(id)
}

async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await?;
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staging temp file");
        }
    }
}

async fn read_document(path: &Path, id: i32) -> Result<DetailRecord, StagingError> {
    let bytes = fs::read(path).await.map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(path, id, &bytes)
}

/// Decode a staged document and check it belongs to the id in its file name
fn decode(path: &Path, id: i32, bytes: &[u8]) -> Result<DetailRecord, StagingError> {
    let record: DetailRecord =
        serde_json::from_slice(bytes).map_err(|source| StagingError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    if record.id != id {
        return Err(StagingError::IdMismatch {
            path: path.to_path_buf(),
            expected: id,
            found: record.id,
        });
    }
    Ok(record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_id_parsing() {
        assert_eq!(staged_id(Path::new("/tmp/raw/25.json")), Some(25));
        assert_eq!(staged_id(Path::new("/tmp/raw/.25.abc.tmp")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/notes.json")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/25.json.bak")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/25json")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/05.json")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/+5.json")), None);
        assert_eq!(staged_id(Path::new("/tmp/raw/-3.json")), Some(-3));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path().join("never-created"));

        assert!(store.ids().await.unwrap().is_empty());
        assert!(store.get(1).await.unwrap().is_none());
        assert_eq!(store.list().count().await, 0);
    }
}
