use std::{io, path::PathBuf};

use thiserror::Error;

use crate::torrent::{InfoHash, TorrentError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("The transfer failed with the following Torrent error: {0}")]
    Torrent(#[from] TorrentError),
    #[error("Failed to open the file at the path `{path}` with the error: `{error}`")]
    OpenError { path: PathBuf, error: io::Error },
    #[error("Failed to allocate {length} bytes for the file at `{path}` with the error: `{error}`")]
    Allocate {
        path: PathBuf,
        length: u64,
        error: io::Error,
    },
    #[error("The file at `{path}` is {actual} bytes long but the torrent expects {expected} bytes.")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("Failed to read piece {index} while checking its hash with the error: `{error}`")]
    HashVerification { index: u32, error: io::Error },
    #[error("A transfer for the info hash `{info_hash}` is already running.")]
    AlreadyRunning { info_hash: InfoHash },
}
