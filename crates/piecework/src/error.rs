use piecework_core::Id20;

use crate::torrent::TorrentMode;

/// Why a torrent entered the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TorrentErrorReason {
    ReadFailure,
    WriteFailure,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] piecework_core::Error),

    #[error("error reading from disk: {0:#}")]
    ReadFailure(#[source] anyhow::Error),
    #[error("error writing to disk: {0:#}")]
    WriteFailure(#[source] anyhow::Error),

    #[error("torrent is in {0:?} mode")]
    InvalidMode(TorrentMode),
    #[error("torrent was stopped")]
    TorrentStopped,
    #[error("torrent is not registered with the disk manager")]
    TorrentNotRegistered,

    #[error("fast resume data belongs to {actual:?}, expected {expected:?}")]
    FastResumeInfoHashMismatch { expected: Id20, actual: Id20 },
    #[error("fast resume data has {actual} pieces, expected {expected}")]
    FastResumePieceCountMismatch { expected: usize, actual: usize },

    #[error("peer not found")]
    PeerNotFound,
    #[error("file index {0} out of range")]
    InvalidFileIndex(usize),

    #[error("timeout {0}")]
    Timeout(&'static str),
    #[error("connect attempt cancelled")]
    ConnectCancelled,
    #[error("wrong info hash in handshake")]
    WrongInfoHash,
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn torrent_error_reason(&self) -> Option<TorrentErrorReason> {
        match self {
            Error::ReadFailure(_) => Some(TorrentErrorReason::ReadFailure),
            Error::WriteFailure(_) => Some(TorrentErrorReason::WriteFailure),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
