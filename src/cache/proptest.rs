//! Property-Based Tests for the Cache Tier
//!
//! # Test Properties
//!
//! 1. **Packet Count**: enough packets for the payload, never an empty one
//! 2. **Chunking**: chunks concatenate back to the payload
//! 3. **First Writer Wins**: `insert_if_absent` never replaces a live entry
//! 4. **Folding**: exactly one registrant per id creates the group

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::delivery::{packet_count, AssetDelivery, ClientHandle, TransferRequest};
use super::folding::{RequestFoldingTable, Requester};
use super::store::ContentStore;
use super::MAX_PACKET_SIZE;
use crate::asset::{Asset, AssetId, AssetType};

// =============================================================================
// Property Strategies
// =============================================================================

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..5000)
}

/// Small id space so that collisions are common
fn id_strategy() -> impl Strategy<Value = AssetId> {
    (1u8..16).prop_map(|n| {
        let mut raw = [0u8; 16];
        raw[15] = n;
        AssetId::new(Uuid::from_bytes(raw))
    })
}

// =============================================================================
// Delivery Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_packet_count_covers_payload(len in 0usize..100_000) {
        let packets = packet_count(len) as usize;
        prop_assert!(packets >= 1);
        prop_assert!(packets * MAX_PACKET_SIZE >= len);
        if len > MAX_PACKET_SIZE {
            prop_assert!((packets - 1) * MAX_PACKET_SIZE < len);
        }
    }

    #[test]
    fn prop_chunks_reassemble(data in payload_strategy()) {
        let asset = Arc::new(Asset::new(AssetId::random(), AssetType::TEXTURE, data.clone()));
        let request = TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            2,
            Bytes::copy_from_slice(asset.id.as_uuid().as_bytes()),
        ).unwrap();

        let delivery = AssetDelivery::resolved(request, asset);
        let chunks = delivery.chunks();

        prop_assert_eq!(chunks.len(), packet_count(data.len()) as usize);
        prop_assert!(chunks.iter().all(|c| c.len() <= MAX_PACKET_SIZE));
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        prop_assert_eq!(joined, data);
    }
}

// =============================================================================
// Store and Folding Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_first_writer_wins(writes in prop::collection::vec((id_strategy(), any::<u8>()), 1..64)) {
        let store = ContentStore::new();
        let mut first = std::collections::HashMap::new();

        for (id, byte) in &writes {
            let asset = Arc::new(Asset::new(*id, AssetType::TEXTURE, vec![*byte]));
            store.insert_if_absent(*id, asset);
            first.entry(*id).or_insert(*byte);
        }

        prop_assert_eq!(store.len(), first.len());
        for (id, byte) in first {
            let cached = store.try_get(&id).unwrap();
            prop_assert_eq!(cached.data.as_ref(), &[byte]);
        }
    }

    #[test]
    fn prop_zero_ttl_never_served(data in payload_strategy()) {
        let store = ContentStore::new();
        let asset = Arc::new(Asset::new(AssetId::random(), AssetType::SOUND, data));
        store.put(asset.id, Arc::clone(&asset), Duration::ZERO);
        prop_assert!(store.try_get(&asset.id).is_none());
    }

    #[test]
    fn prop_one_creator_per_id(ids in prop::collection::vec(id_strategy(), 1..100)) {
        let table = RequestFoldingTable::new();
        let mut creators = std::collections::HashSet::new();
        let mut receivers = Vec::new();

        for id in &ids {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            if table.register_or_join(*id, false, Requester::waiter(tx, true)) {
                prop_assert!(creators.insert(*id));
            }
        }

        prop_assert_eq!(table.len(), creators.len());
        prop_assert_eq!(table.pending_requesters(), ids.len());

        let total: usize = creators
            .iter()
            .map(|id| table.take_and_clear(id).map(|g| g.len()).unwrap_or(0))
            .sum();
        prop_assert_eq!(total, ids.len());
        prop_assert!(table.is_empty());
    }
}
