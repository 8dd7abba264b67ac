//! Request Folding
//!
//! Concurrent misses for the same asset id are folded into one
//! [`PendingRequestGroup`]; only the caller that creates a group issues the
//! upstream fetch. Both table operations run under the same lock, so a
//! requester racing with finalization lands either inside the group being
//! finalized or in a fresh group that triggers its own fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::delivery::TransferRequest;
use crate::asset::{Asset, AssetId};

/// One-shot reply channel for an in-process waiter
pub type AssetReply = oneshot::Sender<Option<Arc<Asset>>>;

/// Someone waiting on an asset resolution
#[derive(Debug)]
pub enum Requester {
    /// In-process caller awaiting a one-shot reply
    Waiter { reply: AssetReply, retryable: bool },
    /// Client transfer answered through the delivery queue
    Transfer(TransferRequest),
}

impl Requester {
    /// In-process waiter
    pub fn waiter(reply: AssetReply, retryable: bool) -> Self {
        Self::Waiter { reply, retryable }
    }

    /// Whether this requester may escalate to peer lookup
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Waiter { retryable, .. } => *retryable,
            Self::Transfer(_) => true,
        }
    }

    /// Whether this requester is a client transfer
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }
}

/// All requesters folded onto one outstanding fetch
#[derive(Debug)]
pub struct PendingRequestGroup {
    id: AssetId,
    is_texture: bool,
    requesters: Vec<Requester>,
    first_requested_at: Instant,
}

impl PendingRequestGroup {
    /// Create a group holding its first requester
    pub fn new(id: AssetId, is_texture: bool, first: Requester) -> Self {
        Self {
            id,
            is_texture,
            requesters: vec![first],
            first_requested_at: Instant::now(),
        }
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn is_texture(&self) -> bool {
        self.is_texture
    }

    pub fn len(&self) -> usize {
        self.requesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requesters.is_empty()
    }

    pub fn first_requested_at(&self) -> Instant {
        self.first_requested_at
    }

    /// Time since the first requester arrived
    pub fn age(&self) -> Duration {
        self.first_requested_at.elapsed()
    }

    pub fn requesters(&self) -> &[Requester] {
        &self.requesters
    }

    pub fn into_requesters(self) -> Vec<Requester> {
        self.requesters
    }

    /// Split into (retryable, non-retryable), preserving arrival order
    pub fn partition_retryable(self) -> (Vec<Requester>, Vec<Requester>) {
        self.requesters.into_iter().partition(Requester::is_retryable)
    }

    /// Whether the first requester to arrive was a client transfer
    pub fn opened_by_transfer(&self) -> bool {
        self.requesters.first().is_some_and(Requester::is_transfer)
    }

    fn push(&mut self, requester: Requester) {
        self.requesters.push(requester);
    }
}

/// Table of outstanding fetches; at most one group per asset id
#[derive(Default)]
pub struct RequestFoldingTable {
    groups: Mutex<HashMap<AssetId, PendingRequestGroup>>,
}

impl RequestFoldingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the group for `id`, creating it if absent.
    ///
    /// Returns `true` when this call created the group; the caller must then
    /// issue the upstream fetch.
    pub fn register_or_join(&self, id: AssetId, is_texture: bool, requester: Requester) -> bool {
        let mut groups = self.groups.lock();
        match groups.get_mut(&id) {
            Some(group) => {
                group.push(requester);
                false
            }
            None => {
                groups.insert(id, PendingRequestGroup::new(id, is_texture, requester));
                true
            }
        }
    }

    /// Remove and return the group for `id`
    pub fn take_and_clear(&self, id: &AssetId) -> Option<PendingRequestGroup> {
        self.groups.lock().remove(id)
    }

    /// Check for an outstanding group
    pub fn contains(&self, id: &AssetId) -> bool {
        self.groups.lock().contains_key(id)
    }

    /// Number of outstanding groups
    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }

    /// Total requesters across all groups
    pub fn pending_requesters(&self) -> usize {
        self.groups.lock().values().map(PendingRequestGroup::len).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::delivery::ClientHandle;
    use bytes::Bytes;

    fn waiter(retryable: bool) -> (Requester, oneshot::Receiver<Option<Arc<Asset>>>) {
        let (tx, rx) = oneshot::channel();
        (Requester::waiter(tx, retryable), rx)
    }

    fn transfer(id: AssetId) -> Requester {
        let params = Bytes::copy_from_slice(id.as_uuid().as_bytes());
        Requester::Transfer(
            TransferRequest::from_params(ClientHandle::random(), uuid::Uuid::new_v4(), 2, params)
                .unwrap(),
        )
    }

    #[test]
    fn test_waiter_pending_until_group_completes() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();
        let (requester, rx) = waiter(true);
        table.register_or_join(id, false, requester);

        let mut rx = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(rx.poll());

        let asset = Arc::new(Asset::new(id, crate::asset::AssetType::TEXTURE, vec![7u8]));
        let group = table.take_and_clear(&id).unwrap();
        for requester in group.into_requesters() {
            if let Requester::Waiter { reply, .. } = requester {
                let _ = reply.send(Some(Arc::clone(&asset)));
            }
        }

        assert!(rx.is_woken());
        let reply = tokio_test::assert_ready!(rx.poll()).unwrap();
        assert_eq!(reply.unwrap().id, id);
    }

    #[test]
    fn test_first_registrant_creates_group() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();

        let (a, _ra) = waiter(true);
        let (b, _rb) = waiter(true);
        let (c, _rc) = waiter(false);

        assert!(table.register_or_join(id, false, a));
        assert!(!table.register_or_join(id, false, b));
        assert!(!table.register_or_join(id, false, c));

        assert_eq!(table.len(), 1);
        assert_eq!(table.pending_requesters(), 3);
    }

    #[test]
    fn test_take_and_clear() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();
        let (a, _ra) = waiter(true);
        table.register_or_join(id, true, a);

        let group = table.take_and_clear(&id).unwrap();
        assert_eq!(group.id(), id);
        assert!(group.is_texture());
        assert_eq!(group.len(), 1);

        assert!(table.take_and_clear(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_join_after_take_starts_new_group() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();

        let (a, _ra) = waiter(true);
        assert!(table.register_or_join(id, false, a));
        let _finalizing = table.take_and_clear(&id).unwrap();

        let (b, _rb) = waiter(true);
        assert!(table.register_or_join(id, false, b));
        assert!(table.contains(&id));
    }

    #[test]
    fn test_partition_retryable_preserves_order() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();

        let (a, _ra) = waiter(true);
        let (b, _rb) = waiter(false);
        let (c, _rc) = waiter(true);
        table.register_or_join(id, false, a);
        table.register_or_join(id, false, b);
        table.register_or_join(id, false, c);
        table.register_or_join(id, false, transfer(id));

        let (retry, no_retry) = table.take_and_clear(&id).unwrap().partition_retryable();
        assert_eq!(retry.len(), 3);
        assert_eq!(no_retry.len(), 1);
        assert!(retry[2].is_transfer());
    }

    #[test]
    fn test_opened_by_transfer() {
        let table = RequestFoldingTable::new();
        let id = AssetId::random();
        table.register_or_join(id, false, transfer(id));
        let (a, _ra) = waiter(true);
        table.register_or_join(id, false, a);
        assert!(table.take_and_clear(&id).unwrap().opened_by_transfer());

        let (b, _rb) = waiter(true);
        let group = PendingRequestGroup::new(id, false, b);
        assert!(!group.opened_by_transfer());
    }

    #[test]
    fn test_concurrent_registration_creates_one_group() {
        let table = Arc::new(RequestFoldingTable::new());
        let id = AssetId::random();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let (tx, _rx) = oneshot::channel();
                    table.register_or_join(id, false, Requester::waiter(tx, true))
                })
            })
            .collect();

        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);
        assert_eq!(table.pending_requesters(), 16);
    }
}
