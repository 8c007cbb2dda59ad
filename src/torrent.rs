use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

pub use hashes::Hashes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

mod hashes {
    use serde::de::{self, Visitor};
    use serde::ser::{Serialize, Serializer};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Hashes(pub Vec<[u8; 20]>);
    struct HashesVisitor;

    impl Serialize for Hashes {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let single_slice = self.0.concat();
            serializer.serialize_bytes(&single_slice)
        }
    }

    impl<'de> Visitor<'de> for HashesVisitor {
        type Value = Hashes;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("Bytes which length is a multiple of 20")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 20 != 0 {
                Err(de::Error::custom(format!(
                    "Bytes which length is a multiple of 20. Got {:?}",
                    v.len()
                )))
            } else {
                Ok(Hashes(
                    v.chunks_exact(20)
                        .map(|slice_20| {
                            let mut hash = [0u8; 20];
                            hash.copy_from_slice(slice_20);
                            hash
                        })
                        .collect(),
                ))
            }
        }
    }

    impl<'de> Deserialize<'de> for Hashes {
        fn deserialize<D>(deserializer: D) -> Result<Hashes, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(HashesVisitor)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// The Metainfo files
pub struct Torrent {
    /// The url of the tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    /// BEP 12 tiers of tracker urls.
    #[serde(rename = "announce-list", default, skip_serializing_if = "Vec::is_empty")]
    pub announce_list: Vec<Vec<String>>,
    /// This maps to a dictionary.
    pub info: Metainfo,
}

/// only used to get at the untouched info dictionary
#[derive(Deserialize)]
struct RawTorrent {
    info: serde_bencode::value::Value,
}

impl Torrent {
    pub fn read_from_file(path: &Path) -> Result<Self, TorrentError> {
        let bytes = std::fs::read(path).map_err(|error| TorrentError::IOReadError {
            error,
            path: path.to_path_buf(),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        let mut torrent = serde_bencode::from_bytes::<Torrent>(bytes)?;

        // the info hash has to cover every key of the info dict, not only the ones we know about
        let raw = serde_bencode::from_bytes::<RawTorrent>(bytes)?;
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        torrent.info.info_hash = InfoHash(Sha1::digest(&info_bytes).into());

        torrent.info.validate()?;
        Ok(torrent)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    /// every announce url, the primary one first
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.announce.iter().cloned().collect();
        for url in self.announce_list.iter().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metainfo {
    /// The name key maps to a UTF-8 encoded string.
    /// In the single file case, the name key is the name of a file, in the muliple file case,
    /// it's the name of a directory.
    pub name: String,
    /// `piece length` maps to the number of bytes in each piece the file is split into.
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// pieces is to be subdivided into strings of length 20,
    /// each of which is the SHA1 hash of the piece at the corresponding index.
    pub pieces: Hashes,
    /// If length is present then the download represents a single file,
    /// otherwise it represents a set of files which go in a directory structure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip)]
    info_hash: InfoHash,
}

impl Default for InfoHash {
    fn default() -> Self {
        InfoHash([0; 20])
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    /// The length of the file, in bytes.
    pub length: u64,
    /// A list of UTF-8 encoded strings corresponding to subdirectory names,
    /// the last of which is the actual file name (a zero length list is an error case).
    pub path: Vec<String>,
}

/// a file of the torrent relative to the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl Metainfo {
    pub fn piece_count(&self) -> u32 {
        self.pieces.0.len() as u32
    }

    pub fn total_length(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.length.unwrap_or(0),
        }
    }

    /// the length of the piece at `index`, only the last one may be shorter
    pub fn piece_len(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let remaining = self.total_length().saturating_sub(begin);
        remaining.min(self.piece_length as u64) as u32
    }

    /// the files in the order their bytes appear in the pieces
    pub fn file_entries(&self) -> Vec<FileEntry> {
        match &self.files {
            None => vec![FileEntry {
                path: PathBuf::from(&self.name),
                length: self.length.unwrap_or(0),
            }],
            Some(files) => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    path.extend(f.path.iter());
                    FileEntry {
                        path,
                        length: f.length,
                    }
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), TorrentError> {
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidInfo("piece length is 0".to_string()));
        }
        if self.length.is_none() == self.files.is_none() {
            return Err(TorrentError::InvalidInfo(
                "exactly one of `length` and `files` must be present".to_string(),
            ));
        }
        let expected_pieces = self.total_length().div_ceil(self.piece_length as u64);
        if expected_pieces != self.pieces.0.len() as u64 {
            return Err(TorrentError::InvalidInfo(format!(
                "{} bytes need {expected_pieces} pieces but {} hashes are given",
                self.total_length(),
                self.pieces.0.len()
            )));
        }

        check_component(&self.name)?;
        for file in self.files.iter().flatten() {
            if file.path.is_empty() {
                return Err(TorrentError::InvalidPath(String::new()));
            }
            for part in &file.path {
                check_component(part)?;
            }
        }
        Ok(())
    }
}

/// a single path element must not escape the download directory
fn check_component(part: &str) -> Result<(), TorrentError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !part.contains(['/', '\\']) => Ok(()),
        _ => Err(TorrentError::InvalidPath(part.to_string())),
    }
}

#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("Failed with error `{error}` to read file with path `{path}`")]
    IOReadError {
        error: std::io::Error,
        path: PathBuf,
    },
    #[error("Failed to deserialize the torrent bencode: `{0}`")]
    InvalidBencode(#[from] serde_bencode::Error),
    #[error("The info dictionary is invalid: {0}")]
    InvalidInfo(String),
    #[error("The torrent contains the unsafe path component `{0}`")]
    InvalidPath(String),
}
