use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::{peer::PeerId, torrent::Metainfo};

/// the part of one file a piece covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub file: usize,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
    pub sections: Vec<Section>,
    /// peers that announced this piece
    peers: Mutex<Vec<PeerId>>,
}

impl Piece {
    /// splits the concatenated files of the torrent into its pieces
    pub fn build_all(info: &Metainfo) -> Vec<Piece> {
        let file_lengths: Vec<u64> = info.file_entries().iter().map(|f| f.length).collect();
        let mut file = 0;
        let mut offset = 0u64;

        (0..info.piece_count())
            .map(|index| {
                let length = info.piece_len(index);
                let mut sections = Vec::new();
                let mut needed = length as u64;
                while needed > 0 && file < file_lengths.len() {
                    let available = file_lengths[file] - offset;
                    if available == 0 {
                        file += 1;
                        offset = 0;
                        continue;
                    }
                    let take = available.min(needed);
                    sections.push(Section {
                        file,
                        offset,
                        length: take,
                    });
                    offset += take;
                    needed -= take;
                }
                Piece {
                    index,
                    length,
                    hash: info.pieces.0[index as usize],
                    sections,
                    peers: Mutex::new(Vec::new()),
                }
            })
            .collect()
    }

    /// returns false if the peer was already known
    pub fn add_peer(&self, peer: PeerId) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.lock().retain(|p| p != peer);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().clone()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.lock().is_empty()
    }

    /// reads the piece from disk and compares it against its SHA1 hash
    pub fn hash_check(&self, files: &[File]) -> io::Result<bool> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; 16 * 1024];
        for section in &self.sections {
            let mut file = &files[section.file];
            file.seek(SeekFrom::Start(section.offset))?;
            let mut left = section.length as usize;
            while left > 0 {
                let n = left.min(buf.len());
                file.read_exact(&mut buf[..n])?;
                hasher.update(&buf[..n]);
                left -= n;
            }
        }
        let digest: [u8; 20] = hasher.finalize().into();
        Ok(digest == self.hash)
    }
}

#[cfg(test)]
mod test_piece {
    use super::*;
    use crate::{
        torrent::{Torrent, test_torrent::torrent_bytes},
        transfer::files::prepare_files,
    };

    #[test]
    fn pieces_span_file_boundaries() {
        let bytes = torrent_bytes(
            "album",
            4,
            vec![
                (vec!["a"], b"abc".to_vec()),
                (vec!["b"], b"defgh".to_vec()),
            ],
        );
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        let pieces = Piece::build_all(&torrent.info);
        assert_eq!(pieces.len(), 2);
        assert_eq!(
            pieces[0].sections,
            vec![
                Section {
                    file: 0,
                    offset: 0,
                    length: 3
                },
                Section {
                    file: 1,
                    offset: 0,
                    length: 1
                },
            ]
        );
        assert_eq!(
            pieces[1].sections,
            vec![Section {
                file: 1,
                offset: 1,
                length: 4
            }]
        );
    }

    #[test]
    fn hash_check_reads_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = torrent_bytes(
            "album",
            4,
            vec![
                (vec!["a"], b"abc".to_vec()),
                (vec!["b"], b"defgh".to_vec()),
            ],
        );
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        std::fs::create_dir_all(dir.path().join("album")).unwrap();
        std::fs::write(dir.path().join("album/a"), b"abc").unwrap();
        std::fs::write(dir.path().join("album/b"), b"defgX").unwrap();

        let prepared = prepare_files(&torrent.info, dir.path()).unwrap();
        let pieces = Piece::build_all(&torrent.info);
        assert!(pieces[0].hash_check(&prepared.files).unwrap());
        assert!(!pieces[1].hash_check(&prepared.files).unwrap());
    }

    #[test]
    fn peers_are_kept_once() {
        let bytes = torrent_bytes("a", 4, vec![(vec![], b"abcd".to_vec())]);
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        let pieces = Piece::build_all(&torrent.info);
        assert!(pieces[0].add_peer(PeerId([1; 20])));
        assert!(!pieces[0].add_peer(PeerId([1; 20])));
        assert!(pieces[0].add_peer(PeerId([2; 20])));
        pieces[0].remove_peer(&PeerId([1; 20]));
        assert_eq!(pieces[0].peers(), vec![PeerId([2; 20])]);
    }
}
