use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, future::select_ok};
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use crate::{
    config::TrackerConfig,
    tracker::{
        AnnounceRequest, AnnounceResponse, Tracker, error::TrackerError, peers::PeerConnections,
    },
};

/// Announces over HTTP to every tracker url of a torrent at once.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: reqwest::Client,
    urls: Vec<Url>,
}

/// the query parameters that serde_urlencoded can handle, the raw byte ids are escaped by hand
#[derive(Debug, Serialize)]
struct Query<'a> {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    numwant: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    /// An integer, indicating how often your client should make a request to the tracker, in seconds.
    #[serde(default)]
    interval: Option<u64>,
    /// number of seeders
    #[serde(default)]
    complete: Option<u32>,
    /// number of leechers
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(default)]
    peers: Option<PeerConnections>,
}

impl HttpTracker {
    /// keeps the http(s) urls, other schemes are skipped
    pub fn new(urls: &[String], config: &TrackerConfig) -> Result<Self, TrackerError> {
        let mut parsed = Vec::new();
        for url in urls {
            let url = Url::parse(url)?;
            if matches!(url.scheme(), "http" | "https") {
                parsed.push(url);
            } else {
                trace!(%url, "skipping tracker with unsupported scheme");
            }
        }
        if parsed.is_empty() {
            return Err(TrackerError::NoAnnounceUrl);
        }

        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            urls: parsed,
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    async fn announce_to(
        &self,
        mut url: Url,
        query: String,
    ) -> Result<AnnounceResponse, TrackerError> {
        url.set_query(Some(&query));
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        parse_response(&bytes, url.as_str())
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let query = to_url_encoded(&request);
        let requests: Vec<_> = self
            .urls
            .iter()
            .map(|url| self.announce_to(url.clone(), query.clone()).boxed())
            .collect();
        let (response, _rem) = select_ok(requests).await?;
        Ok(response)
    }
}

fn to_url_encoded(request: &AnnounceRequest) -> String {
    let scalars = serde_urlencoded::to_string(Query {
        port: request.port,
        uploaded: request.uploaded,
        downloaded: request.downloaded,
        left: request.left,
        compact: 1,
        numwant: request.num_want,
        event: request.event.map(|e| e.as_str()),
    })
    .unwrap_or_default();
    format!(
        "info_hash={}&peer_id={}&{scalars}",
        escape_bytes_url(request.info_hash.as_bytes()),
        escape_bytes_url(request.peer_id.as_bytes()),
    )
}

fn escape_bytes_url(bytes: &[u8; 20]) -> String {
    bytes
        .iter()
        .map(|b| {
            if b.is_ascii_alphanumeric() || matches!(*b, b'-' | b'.' | b'_' | b'~') {
                (*b as char).to_string()
            } else {
                format!("%{}", hex::encode([*b]))
            }
        })
        .collect()
}

fn parse_response(bytes: &[u8], url: &str) -> Result<AnnounceResponse, TrackerError> {
    let response = serde_bencode::from_bytes::<TrackerResponse>(bytes).map_err(|error| {
        TrackerError::InvalidResponse {
            error,
            response: Bytes::copy_from_slice(bytes),
            url: url.to_string(),
        }
    })?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure {
            url: url.to_string(),
            reason,
        });
    }
    Ok(AnnounceResponse {
        interval: Duration::from_secs(response.interval.unwrap_or(0)),
        peers: response.peers.map(|p| p.0).unwrap_or_default(),
        seeders: response.complete,
        leechers: response.incomplete,
    })
}
