use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use tracing::debug;

use crate::{torrent::Metainfo, transfer::error::TransferError};

/// The open files of a transfer, in piece order.
#[derive(Debug)]
pub struct PreparedFiles {
    pub files: Vec<File>,
    /// some file already had data, so the pieces must be verified before trusting the bitfield
    pub check_hash: bool,
}

/// Opens or creates every file of the torrent below `dest`.
pub fn prepare_files(info: &Metainfo, dest: &Path) -> Result<PreparedFiles, TransferError> {
    let entries = info.file_entries();
    let mut files = Vec::with_capacity(entries.len());
    let mut check_hash = false;
    for entry in entries {
        let path = dest.join(&entry.path);
        let (file, exists) = open_or_allocate(&path, entry.length)?;
        debug!(path = %path.display(), length = entry.length, exists, "prepared file");
        check_hash |= exists;
        files.push(file);
    }
    Ok(PreparedFiles { files, check_hash })
}

/// Opens `path`, creating it with its parent directories if needed.
///
/// An empty file is grown to `length` and synced before anything is written to it, and reported
/// as new. A non-empty file must already be exactly `length` bytes long.
pub fn open_or_allocate(path: &Path, length: u64) -> Result<(File, bool), TransferError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| TransferError::OpenError {
            path: parent.to_path_buf(),
            error,
        })?;
    }

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    let file = options.open(path).map_err(|error| TransferError::OpenError {
        path: path.to_path_buf(),
        error,
    })?;

    let size = file
        .metadata()
        .map_err(|error| TransferError::OpenError {
            path: path.to_path_buf(),
            error,
        })?
        .len();

    if size == 0 && length != 0 {
        let allocate = |error| TransferError::Allocate {
            path: path.to_path_buf(),
            length,
            error,
        };
        file.set_len(length).map_err(allocate)?;
        file.sync_all().map_err(allocate)?;
        return Ok((file, false));
    }
    if size != length {
        return Err(TransferError::SizeMismatch {
            path: path.to_path_buf(),
            expected: length,
            actual: size,
        });
    }
    Ok((file, true))
}
