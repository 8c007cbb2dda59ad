use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// largest frame we accept or send
const MAX: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32(self.index);
        dst.put_u32(self.begin);
        dst.put_u32(self.length);
    }

    fn get(src: &mut Bytes) -> Self {
        Self::new(src.get_u32(), src.get_u32(), src.get_u32())
    }
}

/// A message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// the sender finished and checked the piece with this index
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel(BlockRequest),
    /// DHT port of the sender
    Port(u16),
    // fast extension
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast(u32),
}

impl PeerMessage {
    /// the message id, keep-alives have none
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            PeerMessage::KeepAlive => return None,
            PeerMessage::Choke => 0,
            PeerMessage::Unchoke => 1,
            PeerMessage::Interested => 2,
            PeerMessage::NotInterested => 3,
            PeerMessage::Have(_) => 4,
            PeerMessage::Bitfield(_) => 5,
            PeerMessage::Request(_) => 6,
            PeerMessage::Piece { .. } => 7,
            PeerMessage::Cancel(_) => 8,
            PeerMessage::Port(_) => 9,
            PeerMessage::Suggest(_) => 0x0D,
            PeerMessage::HaveAll => 0x0E,
            PeerMessage::HaveNone => 0x0F,
            PeerMessage::Reject(_) => 0x10,
            PeerMessage::AllowedFast(_) => 0x11,
        };
        Some(id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have(_) => "have",
            PeerMessage::Bitfield(_) => "bitfield",
            PeerMessage::Request(_) => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel(_) => "cancel",
            PeerMessage::Port(_) => "port",
            PeerMessage::Suggest(_) => "suggest",
            PeerMessage::HaveAll => "have-all",
            PeerMessage::HaveNone => "have-none",
            PeerMessage::Reject(_) => "reject",
            PeerMessage::AllowedFast(_) => "allowed-fast",
        }
    }

    /// only valid when both sides advertised the fast extension
    pub fn is_fast(&self) -> bool {
        matches!(self.id(), Some(0x0D..=0x11))
    }

    fn payload_len(&self) -> usize {
        match self {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::HaveAll
            | PeerMessage::HaveNone => 0,
            PeerMessage::Have(_) | PeerMessage::Suggest(_) | PeerMessage::AllowedFast(_) => 4,
            PeerMessage::Bitfield(bytes) => bytes.len(),
            PeerMessage::Request(_) | PeerMessage::Cancel(_) | PeerMessage::Reject(_) => 12,
            PeerMessage::Piece { block, .. } => 8 + block.len(),
            PeerMessage::Port(_) => 2,
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Length prefixed framing of [`PeerMessage`]s.
pub struct MessageFramer;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to the read length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes);

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        // Check that the length is not too large to avoid a denial of
        // service attack where the server runs out of memory.
        if length > MAX {
            return Err(invalid(format!("Frame of length {length} is too large.")));
        }

        if src.len() < 4 + length as usize {
            src.reserve(4 + length as usize - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(length as usize).freeze();
        let msg_type = frame.get_u8();
        let expect = |n: usize| {
            if frame.len() == n {
                Ok(())
            } else {
                Err(invalid(format!(
                    "Message type {msg_type} with a payload of {} bytes, expected {n}.",
                    frame.len()
                )))
            }
        };

        let message = match msg_type {
            0 => expect(0).map(|_| PeerMessage::Choke)?,
            1 => expect(0).map(|_| PeerMessage::Unchoke)?,
            2 => expect(0).map(|_| PeerMessage::Interested)?,
            3 => expect(0).map(|_| PeerMessage::NotInterested)?,
            4 => {
                expect(4)?;
                PeerMessage::Have(frame.get_u32())
            }
            5 => PeerMessage::Bitfield(frame),
            6 => {
                expect(12)?;
                PeerMessage::Request(BlockRequest::get(&mut frame))
            }
            7 => {
                if frame.len() < 8 {
                    return Err(invalid("Piece message without a header.".to_string()));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                PeerMessage::Piece {
                    index,
                    begin,
                    block: frame,
                }
            }
            8 => {
                expect(12)?;
                PeerMessage::Cancel(BlockRequest::get(&mut frame))
            }
            9 => {
                expect(2)?;
                PeerMessage::Port(frame.get_u16())
            }
            0x0D => {
                expect(4)?;
                PeerMessage::Suggest(frame.get_u32())
            }
            0x0E => expect(0).map(|_| PeerMessage::HaveAll)?,
            0x0F => expect(0).map(|_| PeerMessage::HaveNone)?,
            0x10 => {
                expect(12)?;
                PeerMessage::Reject(BlockRequest::get(&mut frame))
            }
            0x11 => {
                expect(4)?;
                PeerMessage::AllowedFast(frame.get_u32())
            }
            other => return Err(invalid(format!("Invalid message type: {other}"))),
        };
        Ok(Some(message))
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = io::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Some(id) = item.id() else {
            dst.put_u32(0);
            return Ok(());
        };
        let length = item.payload_len() + 1;
        // Don't send a Message if it is longer than the other end will
        // accept.
        if length > MAX as usize {
            return Err(invalid(format!("Frame of length {length} is too large.")));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(id);
        match item {
            PeerMessage::Have(index)
            | PeerMessage::Suggest(index)
            | PeerMessage::AllowedFast(index) => dst.put_u32(index),
            PeerMessage::Bitfield(bytes) => dst.extend_from_slice(&bytes),
            PeerMessage::Request(req) | PeerMessage::Cancel(req) | PeerMessage::Reject(req) => {
                req.put(dst)
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.extend_from_slice(&block);
            }
            PeerMessage::Port(port) => dst.put_u16(port),
            _ => {}
        }
        Ok(())
    }
}
