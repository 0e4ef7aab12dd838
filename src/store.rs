//! Durable session persistence.
//!
//! A single JSON document holds every session record. Writes are
//! all-or-nothing: the new document is written to a temp file in the same
//! directory and atomically renamed over the primary, after the previous
//! primary is rotated into a numbered backup chain. A reader never observes a
//! half-written document; a corrupted primary falls back to the newest valid
//! backup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::session::Session;

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    sessions: HashMap<String, Session>,
}

pub struct SessionStore {
    dir: PathBuf,
    primary: PathBuf,
    retention: usize,
}

impl SessionStore {
    /// Open (and create if needed) the store directory.
    pub fn open(state_dir: &Path, retention: usize) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        Ok(Self {
            dir: state_dir.to_path_buf(),
            primary: state_dir.join("sessions.json"),
            retention: retention.max(1),
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("sessions.{}.json", n))
    }

    /// Load the session map, falling back through backups on corruption.
    ///
    /// If neither the primary nor any backup parses, the store opens empty
    /// and a loud warning is logged; the control plane keeps running.
    pub fn load(&self) -> HashMap<String, Session> {
        let mut candidates = vec![self.primary.clone()];
        for n in 1..=self.retention {
            candidates.push(self.backup_path(n));
        }

        for (i, path) in candidates.iter().enumerate() {
            if !path.exists() {
                continue;
            }
            match Self::read_document(path) {
                Ok(doc) => {
                    if i > 0 {
                        tracing::warn!(
                            backup = %path.display(),
                            "primary session store was unreadable, recovered from backup"
                        );
                    }
                    return doc.sessions;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "session store candidate unreadable");
                }
            }
        }

        if self.primary.exists() {
            tracing::error!(
                "session store and all backups are corrupt; starting with an empty store"
            );
        }
        HashMap::new()
    }

    fn read_document(path: &Path) -> Result<StoreDocument> {
        let contents = std::fs::read_to_string(path)?;
        let doc: StoreDocument = serde_json::from_str(&contents)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if doc.version != STORE_VERSION {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported store version {}", doc.version),
            )));
        }
        Ok(doc)
    }

    /// Persist the full session map atomically, rotating backups.
    pub fn save(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let doc = StoreDocument {
            version: STORE_VERSION,
            sessions: sessions.clone(),
        };
        let serialized = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::Internal(format!("store serialization failed: {}", e)))?;

        // Stage the new document next to the primary so the final rename is
        // atomic on the same filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        self.rotate_backups()?;
        tmp.persist(&self.primary)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Shift `sessions.json` -> `sessions.1.json` -> ... -> `sessions.N.json`,
    /// dropping the oldest beyond the retention depth.
    fn rotate_backups(&self) -> Result<()> {
        let deepest = self.backup_path(self.retention);
        if deepest.exists() {
            std::fs::remove_file(&deepest)?;
        }
        for n in (1..self.retention).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        if self.primary.exists() {
            std::fs::rename(&self.primary, self.backup_path(1))?;
        }
        Ok(())
    }

    /// Number of backup files currently on disk.
    pub fn backup_count(&self) -> usize {
        (1..=self.retention)
            .filter(|n| self.backup_path(*n).exists())
            .count()
    }
}
