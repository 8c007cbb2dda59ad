use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    peer::{InfoHashValidator, SecretKeyResolver},
    torrent::InfoHash,
    transfer::{error::TransferError, swarm::Swarm},
};

#[derive(Debug, Default)]
struct Tables {
    by_info_hash: HashMap<InfoHash, Arc<Swarm>>,
    by_skey_hash: HashMap<[u8; 20], Arc<Swarm>>,
}

/// The running transfers, looked up by incoming connections.
///
/// Both indices sit behind one mutex, which is only taken when a transfer starts or stops and
/// when a connection is accepted.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    tables: Mutex<Tables>,
}

/// Keeps a transfer registered until dropped.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<TransferRegistry>,
    info_hash: InfoHash,
    skey_hash: [u8; 20],
}

impl TransferRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds the swarm under its info hash and its secret key hash.
    pub fn register(self: &Arc<Self>, swarm: Arc<Swarm>) -> Result<Registration, TransferError> {
        let info_hash = swarm.info_hash();
        let skey_hash = swarm.skey_hash();
        let mut tables = self.tables.lock();
        if tables.by_info_hash.contains_key(&info_hash) {
            return Err(TransferError::AlreadyRunning { info_hash });
        }
        tables.by_info_hash.insert(info_hash, swarm.clone());
        tables.by_skey_hash.insert(skey_hash, swarm);
        Ok(Registration {
            registry: self.clone(),
            info_hash,
            skey_hash,
        })
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<Swarm>> {
        self.tables.lock().by_info_hash.get(info_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_info_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut tables = self.registry.tables.lock();
        tables.by_info_hash.remove(&self.info_hash);
        tables.by_skey_hash.remove(&self.skey_hash);
    }
}

impl SecretKeyResolver for TransferRegistry {
    fn info_hash_for(&self, skey_hash: &[u8; 20]) -> Option<InfoHash> {
        self.tables
            .lock()
            .by_skey_hash
            .get(skey_hash)
            .map(|swarm| swarm.info_hash())
    }
}

impl InfoHashValidator for TransferRegistry {
    fn is_known(&self, info_hash: &InfoHash) -> bool {
        self.tables.lock().by_info_hash.contains_key(info_hash)
    }
}
