use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Failed to parse announce url: `{0}`")]
    InvalidUrl(#[from] url::ParseError),
    #[error("The torrent has no http tracker to announce to.")]
    NoAnnounceUrl,
    #[error("Failed with error: `{error}` to deserialize tracker response from `{url}`: `{response:?}`")]
    InvalidResponse {
        error: serde_bencode::Error,
        response: bytes::Bytes,
        url: String,
    },
    #[error("The tracker at `{url}` refused the announce: `{reason}`")]
    Failure { url: String, reason: String },
    #[error("Something failed with requesting the tracker-response: `{0}`")]
    ReqwestError(#[from] reqwest::Error),
}
