use std::collections::HashMap;

use crate::scheduler::RequestIndex;
use crate::torrent::PeerKey;

/// Single-owner table of globally outstanding requests. At most one peer
/// owns a given request index at any time; reassignment is always an
/// explicit release followed by a claim.
#[derive(Debug, Default)]
pub struct PendingRequests {
    owners: HashMap<RequestIndex, PeerKey>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `r` for `key`. Fails with the existing owner if the index
    /// is already claimed, including by `key` itself.
    pub fn claim(&mut self, r: RequestIndex, key: PeerKey) -> Result<(), PeerKey> {
        match self.owners.get(&r) {
            Some(&owner) => Err(owner),
            None => {
                self.owners.insert(r, key);
                Ok(())
            }
        }
    }

    pub fn owner(&self, r: RequestIndex) -> Option<PeerKey> {
        self.owners.get(&r).copied()
    }

    /// Releases `r` if it is held by `key`. Returns whether anything was
    /// released; a mismatched owner is left untouched.
    pub fn release(&mut self, r: RequestIndex, key: PeerKey) -> bool {
        if self.owners.get(&r) == Some(&key) {
            self.owners.remove(&r);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
