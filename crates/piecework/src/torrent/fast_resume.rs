use std::path::Path;

use anyhow::Context;
use piecework_core::{BitField, Id20};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::Error;

/// Persisted piece state, letting a restart skip re-hashing verified data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastResume {
    pub info_hash: Id20,
    pub bitfield: BitField,
    /// Pieces whose state is unknown and must be hashed on start.
    pub unhashed: BitField,
}

impl FastResume {
    pub fn new(info_hash: Id20, bitfield: BitField, unhashed: BitField) -> Self {
        Self {
            info_hash,
            bitfield,
            unhashed,
        }
    }

    /// Checks the data belongs to this torrent.
    pub fn validate(&self, info_hash: Id20, piece_count: usize) -> crate::Result<()> {
        if self.info_hash != info_hash {
            return Err(Error::FastResumeInfoHashMismatch {
                expected: info_hash,
                actual: self.info_hash,
            });
        }
        for actual in [self.bitfield.len(), self.unhashed.len()] {
            if actual != piece_count {
                return Err(Error::FastResumePieceCountMismatch {
                    expected: piece_count,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Writes to a temporary file first and renames it into place, so a crash
    /// never leaves a truncated file behind.
    pub async fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let mut tmp_filename = path.as_os_str().to_owned();
        tmp_filename.push(".tmp");
        let tmp_filename = std::path::PathBuf::from(tmp_filename);

        let buf = serde_json::to_vec(self).context("error serializing")?;
        let mut tmp = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_filename)
            .await
            .with_context(|| format!("error opening {tmp_filename:?}"))?;
        tmp.write_all(&buf)
            .await
            .with_context(|| format!("error writing {tmp_filename:?}"))?;
        tmp.sync_all()
            .await
            .with_context(|| format!("error syncing {tmp_filename:?}"))?;
        drop(tmp);
        tokio::fs::rename(&tmp_filename, path)
            .await
            .with_context(|| format!("error renaming {tmp_filename:?} to {path:?}"))?;
        debug!(?path, "saved fast resume");
        Ok(())
    }

    pub async fn load_from(path: &Path) -> anyhow::Result<Self> {
        let buf = tokio::fs::read(path)
            .await
            .with_context(|| format!("error reading {path:?}"))?;
        serde_json::from_slice(&buf).with_context(|| format!("error deserializing {path:?}"))
    }
}
