use std::collections::HashSet;

use parking_lot::Mutex;

use crate::peer::PeerId;

/// The peer ids with a live connection in one swarm.
#[derive(Debug, Default)]
pub struct PeerIdRegistry {
    ids: Mutex<HashSet<PeerId>>,
}

/// Removes its peer id from the registry when dropped.
#[derive(Debug)]
pub struct PeerIdGuard<'a> {
    registry: &'a PeerIdRegistry,
    id: PeerId,
}

impl PeerIdRegistry {
    /// adds `id` unless it is already connected, returns whether it was added
    pub fn add(&self, id: PeerId) -> bool {
        self.ids.lock().insert(id)
    }

    pub fn remove(&self, id: &PeerId) {
        self.ids.lock().remove(id);
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// [`add`](Self::add) with the removal tied to the returned guard
    pub fn claim(&self, id: PeerId) -> Option<PeerIdGuard<'_>> {
        self.add(id).then(|| PeerIdGuard { registry: self, id })
    }
}

impl Drop for PeerIdGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod test_peer_ids {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn only_one_claim_wins() {
        let registry = Arc::new(PeerIdRegistry::default());
        let winners = Arc::new(AtomicUsize::new(0));
        let id = PeerId([7; 20]);

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if registry.add(id) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn guard_releases_the_id() {
        let registry = PeerIdRegistry::default();
        let id = PeerId([1; 20]);
        {
            let _guard = registry.claim(id).unwrap();
            assert!(registry.contains(&id));
            assert!(registry.claim(id).is_none());
        }
        assert!(!registry.contains(&id));

        // removing twice is harmless
        registry.remove(&id);
        assert!(registry.claim(id).is_some());
    }
}
