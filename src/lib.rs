pub mod bitfield;
pub mod client;
pub mod config;
pub mod logging;
pub mod peer;
pub mod peer_manager;
pub mod torrent;
pub mod tracker;
pub mod transfer;

pub use bitfield::{Bitfield, Extensions};
pub use client::{Client, ClientError, TransferHandle};
pub use config::Config;
pub use peer::PeerId;
pub use torrent::{InfoHash, Torrent};
pub use transfer::{Transfer, TransferRegistry};
