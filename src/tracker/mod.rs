use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{peer::PeerId, torrent::InfoHash};

pub mod error;
pub mod http;

pub use error::TrackerError;
pub use http::HttpTracker;

/// how long the final `stopped` announce may take on shutdown
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// the port we accept connections on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// None for the regular announces in between
    pub event: Option<AnnounceEvent>,
    pub num_want: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// zero if the tracker did not say
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
}

/// Byte counters reported with every announce.
pub trait Progress: Send + Sync {
    fn downloaded(&self) -> u64;
    fn uploaded(&self) -> u64;
    fn left(&self) -> u64;
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;
}

/// Everything the announce loop needs to build its requests.
#[derive(Clone)]
pub struct Announcer {
    pub tracker: Arc<dyn Tracker>,
    pub progress: Arc<dyn Progress>,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub num_want: u32,
    /// wait after a failed announce, or when the tracker sends no interval
    pub retry_interval: Duration,
}

impl Announcer {
    async fn announce(&self, event: Option<AnnounceEvent>) -> Result<AnnounceResponse, TrackerError> {
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.progress.uploaded(),
            downloaded: self.progress.downloaded(),
            left: self.progress.left(),
            event,
            num_want: if event == Some(AnnounceEvent::Stopped) {
                0
            } else {
                self.num_want
            },
        };
        self.tracker.announce(request).await
    }
}

/// Announces until `stop` fires and sends every result to `results`.
///
/// The first announce carries `event` and is retried with it until it succeeds, the ones after
/// carry no event. Every wait races `stop`. On the way out a `stopped` announce is sent, but only
/// if the tracker heard from us before.
pub async fn announce_periodically(
    announcer: Announcer,
    event: AnnounceEvent,
    results: mpsc::Sender<Result<AnnounceResponse, TrackerError>>,
    stop: CancellationToken,
) {
    let mut event = Some(event);
    let mut announced = false;
    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = announcer.announce(event) => result,
        };
        let wait = match &result {
            Ok(response) => {
                announced = true;
                event = None;
                if response.interval.is_zero() {
                    announcer.retry_interval
                } else {
                    response.interval
                }
            }
            Err(_) => announcer.retry_interval,
        };
        trace!(?wait, ok = result.is_ok(), "announce finished");

        tokio::select! {
            _ = stop.cancelled() => break,
            sent = results.send(result) => if sent.is_err() { break },
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    if announced {
        let stopped = announcer.announce(Some(AnnounceEvent::Stopped));
        match tokio::time::timeout(STOPPED_ANNOUNCE_TIMEOUT, stopped).await {
            Ok(Ok(_)) => trace!("sent stopped announce"),
            Ok(Err(error)) => debug!(%error, "stopped announce failed"),
            Err(_) => debug!("stopped announce timed out"),
        }
    }
}

pub(crate) mod peers {
    use std::{
        fmt,
        net::{IpAddr, Ipv4Addr, SocketAddr},
    };

    use serde::{
        Deserialize, Deserializer,
        de::{self, SeqAccess, Visitor},
    };

    /// The peers of an announce response, compact or as a list of dictionaries.
    #[derive(Debug, Clone)]
    pub struct PeerConnections(pub Vec<SocketAddr>);
    struct PeersVisitor;

    #[derive(Deserialize)]
    struct PeerDict {
        ip: String,
        port: u16,
    }

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = PeerConnections;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("A string of multiples of 6 bytes or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(de::Error::custom(format!(
                    "Bytes which length is a multiple of 6. Got {:?}",
                    v.len()
                )));
            }
            Ok(PeerConnections(
                v.chunks_exact(6)
                    .map(|chunk| {
                        SocketAddr::new(
                            IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                            u16::from_be_bytes([chunk[4], chunk[5]]),
                        )
                    })
                    .collect(),
            ))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerDict>()? {
                // trackers may hand out host names, those are skipped
                if let Ok(ip) = peer.ip.parse::<IpAddr>() {
                    peers.push(SocketAddr::new(ip, peer.port));
                }
            }
            Ok(PeerConnections(peers))
        }
    }

    impl<'de> Deserialize<'de> for PeerConnections {
        fn deserialize<D>(deserializer: D) -> Result<PeerConnections, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(PeersVisitor)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_tracker {
    use parking_lot::Mutex;

    use super::*;

    /// records every request and answers with a fixed peer list
    #[derive(Default)]
    pub(crate) struct MockTracker {
        pub(crate) requests: Mutex<Vec<AnnounceRequest>>,
        pub(crate) peers: Vec<SocketAddr>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Tracker for MockTracker {
        async fn announce(
            &self,
            request: AnnounceRequest,
        ) -> Result<AnnounceResponse, TrackerError> {
            self.requests.lock().push(request);
            if self.fail {
                return Err(TrackerError::NoAnnounceUrl);
            }
            Ok(AnnounceResponse {
                interval: Duration::from_secs(3600),
                peers: self.peers.clone(),
                seeders: Some(1),
                leechers: Some(0),
            })
        }
    }

    struct Fixed;

    impl Progress for Fixed {
        fn downloaded(&self) -> u64 {
            4
        }
        fn uploaded(&self) -> u64 {
            0
        }
        fn left(&self) -> u64 {
            6
        }
    }

    fn announcer(tracker: Arc<MockTracker>) -> Announcer {
        Announcer {
            tracker,
            progress: Arc::new(Fixed),
            info_hash: InfoHash([1; 20]),
            peer_id: PeerId([2; 20]),
            port: 6881,
            num_want: 50,
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn first_event_then_stopped() {
        let tracker = Arc::new(MockTracker {
            peers: vec!["10.0.0.1:6881".parse().unwrap()],
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let task = tokio::spawn(announce_periodically(
            announcer(tracker.clone()),
            AnnounceEvent::Completed,
            tx,
            stop.clone(),
        ));

        let response = rx.recv().await.unwrap().unwrap();
        assert_eq!(response.peers.len(), 1);
        stop.cancel();
        task.await.unwrap();

        let requests = tracker.requests.lock();
        assert_eq!(requests[0].event, Some(AnnounceEvent::Completed));
        assert_eq!(requests[0].left, 6);
        let last = requests.last().unwrap();
        assert_eq!(last.event, Some(AnnounceEvent::Stopped));
        assert_eq!(last.num_want, 0);
    }

    #[tokio::test]
    async fn errors_are_reported_and_retried() {
        let tracker = Arc::new(MockTracker {
            fail: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let task = tokio::spawn(announce_periodically(
            announcer(tracker.clone()),
            AnnounceEvent::Started,
            tx,
            stop.clone(),
        ));

        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.unwrap().is_err());
        stop.cancel();
        task.await.unwrap();

        let requests = tracker.requests.lock();
        assert!(requests.len() >= 2);
        // the start event is repeated until it gets through, no stopped without a start
        assert!(
            requests
                .iter()
                .all(|r| r.event == Some(AnnounceEvent::Started))
        );
    }
}
