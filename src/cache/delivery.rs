//! Delivery Pipeline
//!
//! Final hand-off of resolved assets to client transports. Resolution and
//! delivery are decoupled by the delivery queue so that slow transport I/O
//! never blocks resolution.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::MAX_PACKET_SIZE;
use crate::asset::{Asset, AssetId};
use crate::error::{Error, Result};

/// Number of fixed-size packets needed to carry `len` bytes (minimum 1)
pub fn packet_count(len: usize) -> u32 {
    packet_count_with(len, MAX_PACKET_SIZE)
}

/// [`packet_count`] for an arbitrary chunk size
pub fn packet_count_with(len: usize, chunk_size: usize) -> u32 {
    debug_assert!(chunk_size > 0);
    if len <= chunk_size {
        return 1;
    }
    len.div_ceil(chunk_size) as u32
}

/// Opaque client identity; the transport maps it to a live connection
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientHandle(Uuid);

impl ClientHandle {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientHandle({})", self.0)
    }
}

/// Where a client transfer request names its asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferSource {
    /// Asset id in the first 16 parameter bytes
    Direct,
    /// Asset id at parameter offset 80 (inventory item transfer)
    Inventory,
}

impl TransferSource {
    const DIRECT_CODE: u8 = 2;
    const INVENTORY_CODE: u8 = 3;
    const INVENTORY_ASSET_OFFSET: usize = 80;

    /// Decode a wire source code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            Self::DIRECT_CODE => Some(Self::Direct),
            Self::INVENTORY_CODE => Some(Self::Inventory),
            _ => None,
        }
    }

    /// Wire source code
    pub fn code(&self) -> u8 {
        match self {
            Self::Direct => Self::DIRECT_CODE,
            Self::Inventory => Self::INVENTORY_CODE,
        }
    }

    fn asset_offset(&self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Inventory => Self::INVENTORY_ASSET_OFFSET,
        }
    }
}

/// A client's request to have an asset streamed to it
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub client: ClientHandle,
    pub transfer_id: Uuid,
    pub asset_id: AssetId,
    pub source: TransferSource,
    pub params: Bytes,
    pub is_texture: bool,
}

impl TransferRequest {
    /// Build a request from raw transfer packet fields
    pub fn from_params(
        client: ClientHandle,
        transfer_id: Uuid,
        source_code: u8,
        params: Bytes,
    ) -> Result<Self> {
        let source = TransferSource::from_code(source_code).ok_or_else(|| {
            Error::InvalidRequest(format!("unrecognized transfer source {}", source_code))
        })?;
        let asset_id = AssetId::from_slice_at(&params, source.asset_offset()).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "transfer params too short for {:?} source ({} bytes)",
                source,
                params.len()
            ))
        })?;

        Ok(Self {
            client,
            transfer_id,
            asset_id,
            source,
            params,
            is_texture: false,
        })
    }

    /// Scripts cannot be retrieved by direct request
    pub fn permits(&self, asset: &Asset) -> bool {
        !(self.source == TransferSource::Direct && asset.asset_type.is_script_source())
    }
}

/// Result carried back to a client
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Found { asset: Arc<Asset>, packet_count: u32 },
    NotFound,
    Denied,
}

/// A ready-to-send (requester, result) pair
#[derive(Debug, Clone)]
pub struct AssetDelivery {
    pub request: TransferRequest,
    pub outcome: DeliveryOutcome,
}

impl AssetDelivery {
    /// Resolve a transfer with an asset (or deny it when not permitted)
    pub fn resolved(request: TransferRequest, asset: Arc<Asset>) -> Self {
        if !request.permits(&asset) {
            return Self {
                request,
                outcome: DeliveryOutcome::Denied,
            };
        }
        let packets = packet_count(asset.len());
        Self {
            request,
            outcome: DeliveryOutcome::Found {
                asset,
                packet_count: packets,
            },
        }
    }

    /// Resolve a transfer as not found
    pub fn not_found(request: TransferRequest) -> Self {
        Self {
            request,
            outcome: DeliveryOutcome::NotFound,
        }
    }

    /// Resolve from an optional lookup result
    pub fn from_lookup(request: TransferRequest, asset: Option<Arc<Asset>>) -> Self {
        match asset {
            Some(asset) => Self::resolved(request, asset),
            None => Self::not_found(request),
        }
    }

    /// Whether the payload is being delivered
    pub fn is_found(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Found { .. })
    }

    /// Payload split into packet-sized slices (zero-copy)
    pub fn chunks(&self) -> Vec<Bytes> {
        match &self.outcome {
            DeliveryOutcome::Found { asset, .. } if asset.is_empty() => vec![Bytes::new()],
            DeliveryOutcome::Found { asset, .. } => (0..asset.len())
                .step_by(MAX_PACKET_SIZE)
                .map(|start| {
                    let end = (start + MAX_PACKET_SIZE).min(asset.len());
                    asset.data.slice(start..end)
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Client transport port
#[async_trait]
pub trait AssetTransport: Send + Sync {
    /// Hand a delivery to the client connection behind `delivery.request.client`
    async fn deliver(&self, delivery: AssetDelivery) -> Result<()>;
}

/// Logging-based transport.
///
/// Useful when no client-facing transport is attached to this node.
#[derive(Debug, Clone, Default)]
pub struct LoggingTransport {
    info_level: bool,
}

impl LoggingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log deliveries at info level instead of debug
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

#[async_trait]
impl AssetTransport for LoggingTransport {
    async fn deliver(&self, delivery: AssetDelivery) -> Result<()> {
        let (outcome, packets) = match &delivery.outcome {
            DeliveryOutcome::Found { packet_count, .. } => ("found", *packet_count),
            DeliveryOutcome::NotFound => ("not_found", 0),
            DeliveryOutcome::Denied => ("denied", 0),
        };

        if self.info_level {
            info!(
                client = %delivery.request.client,
                asset = %delivery.request.asset_id,
                outcome,
                packets,
                "Asset delivery"
            );
        } else {
            debug!(
                client = %delivery.request.client,
                asset = %delivery.request.asset_id,
                outcome,
                packets,
                "Asset delivery"
            );
        }
        Ok(())
    }
}

/// In-memory transport for testing
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    deliveries: parking_lot::RwLock<Vec<AssetDelivery>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected deliveries, in hand-off order
    pub fn deliveries(&self) -> Vec<AssetDelivery> {
        self.deliveries.read().clone()
    }

    /// Deliveries addressed to one client
    pub fn for_client(&self, client: ClientHandle) -> Vec<AssetDelivery> {
        self.deliveries
            .read()
            .iter()
            .filter(|d| d.request.client == client)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.read().is_empty()
    }
}

#[async_trait]
impl AssetTransport for InMemoryTransport {
    async fn deliver(&self, delivery: AssetDelivery) -> Result<()> {
        self.deliveries.write().push(delivery);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetType;
    use assert_matches::assert_matches;

    fn direct_request(asset_id: AssetId) -> TransferRequest {
        let mut params = vec![0u8; 16];
        params.copy_from_slice(asset_id.as_uuid().as_bytes());
        TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            2,
            Bytes::from(params),
        )
        .unwrap()
    }

    #[test]
    fn test_packet_count_boundaries() {
        assert_eq!(packet_count(0), 1);
        assert_eq!(packet_count(1), 1);
        assert_eq!(packet_count(600), 1);
        assert_eq!(packet_count(601), 2);
        assert_eq!(packet_count(1200), 2);
        assert_eq!(packet_count(1201), 3);
    }

    #[test]
    fn test_transfer_from_direct_params() {
        let id = AssetId::random();
        let request = direct_request(id);
        assert_eq!(request.asset_id, id);
        assert_eq!(request.source, TransferSource::Direct);
    }

    #[test]
    fn test_transfer_from_inventory_params() {
        let id = AssetId::random();
        let mut params = vec![0u8; 100];
        params[80..96].copy_from_slice(id.as_uuid().as_bytes());

        let request =
            TransferRequest::from_params(ClientHandle::random(), Uuid::new_v4(), 3, params.into())
                .unwrap();
        assert_eq!(request.asset_id, id);
        assert_eq!(request.source, TransferSource::Inventory);
    }

    #[test]
    fn test_transfer_rejects_unknown_source_and_short_params() {
        let result = TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            7,
            Bytes::from(vec![0u8; 16]),
        );
        assert_matches!(result, Err(Error::InvalidRequest(_)));

        let result = TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            3,
            Bytes::from(vec![0u8; 40]),
        );
        assert_matches!(result, Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_direct_script_is_denied() {
        let id = AssetId::random();
        let script = Arc::new(Asset::new(id, AssetType::LSL_TEXT, &b"default {}"[..]));

        let delivery = AssetDelivery::resolved(direct_request(id), script);
        assert_matches!(delivery.outcome, DeliveryOutcome::Denied);
        assert!(delivery.chunks().is_empty());
    }

    #[test]
    fn test_chunks() {
        let id = AssetId::random();
        let asset = Arc::new(Asset::new(id, AssetType::TEXTURE, vec![9u8; 1300]));
        let delivery = AssetDelivery::resolved(direct_request(id), asset);

        assert_matches!(
            delivery.outcome,
            DeliveryOutcome::Found {
                packet_count: 3,
                ..
            }
        );
        let chunks = delivery.chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 600);
        assert_eq!(chunks[2].len(), 100);
    }

    #[test]
    fn test_empty_asset_yields_one_chunk() {
        let id = AssetId::random();
        let asset = Arc::new(Asset::new(id, AssetType::NOTECARD, Bytes::new()));
        let delivery = AssetDelivery::resolved(direct_request(id), asset);

        assert_eq!(delivery.chunks().len(), 1);
        assert!(delivery.is_found());
    }

    #[tokio::test]
    async fn test_in_memory_transport() {
        let transport = InMemoryTransport::new();
        assert!(transport.is_empty());

        let request = direct_request(AssetId::random());
        let client = request.client;
        transport
            .deliver(AssetDelivery::not_found(request))
            .await
            .unwrap();

        assert_eq!(transport.len(), 1);
        assert_eq!(transport.for_client(client).len(), 1);
        assert!(transport.for_client(ClientHandle::random()).is_empty());
    }

    #[tokio::test]
    async fn test_logging_transport() {
        let transport = LoggingTransport::info_level();
        let request = direct_request(AssetId::random());
        transport
            .deliver(AssetDelivery::not_found(request))
            .await
            .unwrap();
    }
}
