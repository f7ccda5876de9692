// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Lease and lifecycle messages: attach/detach, keepalive, revoke,
//! announce, shutdown, and the supervisor hello/config exchange.

use super::{
    template_id, HugepagesPolicy, LeaseRevokeReason, MessageHeader, PublishMode, Reader,
    ResponseCode, Role, ShutdownReason, Writer, NULL_U32,
};
use crate::error::Result;

/// One payload pool advertised in an attach response or announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescriptor {
    pub pool_id: u16,
    pub stride_bytes: u32,
    pub nslots: u32,
    pub uri: String,
}

const POOL_BLOCK: u16 = 12;

fn encode_pools(w: &mut Writer, pools: &[PoolDescriptor]) -> Result<()> {
    w.group(POOL_BLOCK, pools.len())?;
    for pool in pools {
        w.put_u16(pool.pool_id);
        w.put_u16(0);
        w.put_u32(pool.stride_bytes);
        w.put_u32(pool.nslots);
        w.put_str(&pool.uri)?;
    }
    Ok(())
}

fn decode_pools(r: &mut Reader<'_>) -> Result<Vec<PoolDescriptor>> {
    let (block, count) = r.group()?;
    let mut pools = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let entry_start = r.position();
        let pool_id = r.u16()?;
        let _pad = r.u16()?;
        let stride_bytes = r.u32()?;
        let nslots = r.u32()?;
        // Skip additive extensions of the fixed entry block.
        r.set_position(entry_start + block as usize)?;
        let uri = r.str()?;
        pools.push(PoolDescriptor {
            pool_id,
            stride_bytes,
            nslots,
            uri,
        });
    }
    Ok(pools)
}

// ============================================================================
// AttachRequest
// ============================================================================

/// Client -> driver: request a lease on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub correlation_id: i64,
    pub stream_id: u32,
    pub client_id: u32,
    pub expected_layout_version: u32,
    /// `NULL_U32` when the driver should pick one.
    pub desired_node_id: u32,
    pub role: Role,
    pub publish_mode: PublishMode,
    pub hugepages_policy: HugepagesPolicy,
}

impl AttachRequest {
    const BLOCK: u16 = 28;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::ATTACH_REQUEST, Self::BLOCK);
        w.put_i64(self.correlation_id);
        w.put_u32(self.stream_id);
        w.put_u32(self.client_id);
        w.put_u32(self.expected_layout_version);
        w.put_u32(self.desired_node_id);
        w.put_u8(self.role as u8);
        w.put_u8(self.publish_mode as u8);
        w.put_u8(self.hugepages_policy as u8);
        w.put_u8(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let correlation_id = r.i64()?;
        let stream_id = r.u32()?;
        let client_id = r.u32()?;
        let expected_layout_version = r.u32()?;
        let desired_node_id = r.u32()?;
        let role = Role::from_u8(r.u8()?)?;
        let publish_mode = PublishMode::from_u8(r.u8()?)?;
        let hugepages_policy = HugepagesPolicy::from_u8(r.u8()?)?;
        Ok(Self {
            correlation_id,
            stream_id,
            client_id,
            expected_layout_version,
            desired_node_id,
            role,
            publish_mode,
            hugepages_policy,
        })
    }
}

// ============================================================================
// AttachResponse
// ============================================================================

/// Driver -> client: lease grant (with ring layout) or rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachResponse {
    pub correlation_id: i64,
    pub code: ResponseCode,
    pub lease_id: u64,
    pub epoch: u64,
    pub keepalive_interval_ns: u64,
    pub stream_id: u32,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_slot_bytes: u32,
    pub node_id: u32,
    pub error_message: String,
    pub header_uri: String,
    pub pools: Vec<PoolDescriptor>,
}

impl AttachResponse {
    const BLOCK: u16 = 56;

    /// A rejection carrying only the code and message.
    #[must_use]
    pub fn error(correlation_id: i64, code: ResponseCode, message: &str) -> Self {
        Self {
            correlation_id,
            code,
            lease_id: 0,
            epoch: 0,
            keepalive_interval_ns: 0,
            stream_id: 0,
            layout_version: 0,
            header_nslots: 0,
            header_slot_bytes: 0,
            node_id: NULL_U32,
            error_message: message.to_string(),
            header_uri: String::new(),
            pools: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::ATTACH_RESPONSE, Self::BLOCK);
        w.put_i64(self.correlation_id);
        w.put_u64(self.lease_id);
        w.put_u64(self.epoch);
        w.put_u64(self.keepalive_interval_ns);
        w.put_u32(self.stream_id);
        w.put_u32(self.layout_version);
        w.put_u32(self.header_nslots);
        w.put_u32(self.header_slot_bytes);
        w.put_u32(self.node_id);
        w.put_u8(self.code as u8);
        w.put_u8(0);
        w.put_u16(0);
        w.put_str(&self.error_message)?;
        w.put_str(&self.header_uri)?;
        encode_pools(&mut w, &self.pools)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let correlation_id = r.i64()?;
        let lease_id = r.u64()?;
        let epoch = r.u64()?;
        let keepalive_interval_ns = r.u64()?;
        let stream_id = r.u32()?;
        let layout_version = r.u32()?;
        let header_nslots = r.u32()?;
        let header_slot_bytes = r.u32()?;
        let node_id = r.u32()?;
        let code = ResponseCode::from_u8(r.u8()?)?;
        r.skip_block(header);
        let error_message = r.str()?;
        let header_uri = r.str()?;
        let pools = decode_pools(&mut r)?;
        Ok(Self {
            correlation_id,
            code,
            lease_id,
            epoch,
            keepalive_interval_ns,
            stream_id,
            layout_version,
            header_nslots,
            header_slot_bytes,
            node_id,
            error_message,
            header_uri,
            pools,
        })
    }
}

// ============================================================================
// DetachRequest / DetachResponse
// ============================================================================

/// Client -> driver: release a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachRequest {
    pub correlation_id: i64,
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
}

impl DetachRequest {
    const BLOCK: u16 = 28;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::DETACH_REQUEST, Self::BLOCK);
        w.put_i64(self.correlation_id);
        w.put_u64(self.lease_id);
        w.put_u32(self.stream_id);
        w.put_u32(self.client_id);
        w.put_u8(self.role as u8);
        w.put_u8(0);
        w.put_u16(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let correlation_id = r.i64()?;
        let lease_id = r.u64()?;
        let stream_id = r.u32()?;
        let client_id = r.u32()?;
        let role = Role::from_u8(r.u8()?)?;
        Ok(Self {
            correlation_id,
            lease_id,
            stream_id,
            client_id,
            role,
        })
    }
}

/// Driver -> client: detach outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachResponse {
    pub correlation_id: i64,
    pub code: ResponseCode,
    pub error_message: String,
}

impl DetachResponse {
    const BLOCK: u16 = 12;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::DETACH_RESPONSE, Self::BLOCK);
        w.put_i64(self.correlation_id);
        w.put_u8(self.code as u8);
        w.put_u8(0);
        w.put_u16(0);
        w.put_str(&self.error_message)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let correlation_id = r.i64()?;
        let code = ResponseCode::from_u8(r.u8()?)?;
        r.skip_block(header);
        let error_message = r.str()?;
        Ok(Self {
            correlation_id,
            code,
            error_message,
        })
    }
}

// ============================================================================
// LeaseKeepalive / LeaseRevoked
// ============================================================================

/// Client -> driver: extend a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseKeepalive {
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
}

impl LeaseKeepalive {
    const BLOCK: u16 = 20;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::LEASE_KEEPALIVE, Self::BLOCK);
        w.put_u64(self.lease_id);
        w.put_u32(self.stream_id);
        w.put_u32(self.client_id);
        w.put_u8(self.role as u8);
        w.put_u8(0);
        w.put_u16(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let lease_id = r.u64()?;
        let stream_id = r.u32()?;
        let client_id = r.u32()?;
        let role = Role::from_u8(r.u8()?)?;
        Ok(Self {
            lease_id,
            stream_id,
            client_id,
            role,
        })
    }
}

/// Driver -> client: a lease ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRevoked {
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub reason: LeaseRevokeReason,
    pub message: String,
}

impl LeaseRevoked {
    const BLOCK: u16 = 20;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::LEASE_REVOKED, Self::BLOCK);
        w.put_u64(self.lease_id);
        w.put_u32(self.stream_id);
        w.put_u32(self.client_id);
        w.put_u8(self.role as u8);
        w.put_u8(self.reason as u8);
        w.put_u16(0);
        w.put_str(&self.message)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let lease_id = r.u64()?;
        let stream_id = r.u32()?;
        let client_id = r.u32()?;
        let role = Role::from_u8(r.u8()?)?;
        let reason = LeaseRevokeReason::from_u8(r.u8()?)?;
        r.skip_block(header);
        let message = r.str()?;
        Ok(Self {
            lease_id,
            stream_id,
            client_id,
            role,
            reason,
            message,
        })
    }
}

// ============================================================================
// DriverShutdown
// ============================================================================

/// Driver -> everyone: the driver is going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverShutdown {
    pub reason: ShutdownReason,
    pub message: String,
}

impl DriverShutdown {
    const BLOCK: u16 = 4;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::DRIVER_SHUTDOWN, Self::BLOCK);
        w.put_u8(self.reason as u8);
        w.put_u8(0);
        w.put_u16(0);
        w.put_str(&self.message)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let reason = ShutdownReason::from_u8(r.u8()?)?;
        r.skip_block(header);
        let message = r.str()?;
        Ok(Self { reason, message })
    }
}

// ============================================================================
// ShmPoolAnnounce
// ============================================================================

/// Driver -> consumers: a stream epoch and its ring files.
#[derive(Debug, Clone, PartialEq)]
pub struct ShmPoolAnnounce {
    pub epoch: u64,
    pub timestamp_ns: u64,
    pub stream_id: u32,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_slot_bytes: u32,
    pub require_hugepages: bool,
    pub clock_domain: u8,
    pub header_uri: String,
    pub pools: Vec<PoolDescriptor>,
}

impl ShmPoolAnnounce {
    const BLOCK: u16 = 36;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::SHM_POOL_ANNOUNCE, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.timestamp_ns);
        w.put_u32(self.stream_id);
        w.put_u32(self.layout_version);
        w.put_u32(self.header_nslots);
        w.put_u32(self.header_slot_bytes);
        w.put_u8(u8::from(self.require_hugepages));
        w.put_u8(self.clock_domain);
        w.put_u16(0);
        w.put_str(&self.header_uri)?;
        encode_pools(&mut w, &self.pools)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let timestamp_ns = r.u64()?;
        let stream_id = r.u32()?;
        let layout_version = r.u32()?;
        let header_nslots = r.u32()?;
        let header_slot_bytes = r.u32()?;
        let require_hugepages = r.u8()? != 0;
        let clock_domain = r.u8()?;
        r.skip_block(header);
        let header_uri = r.str()?;
        let pools = decode_pools(&mut r)?;
        Ok(Self {
            epoch,
            timestamp_ns,
            stream_id,
            layout_version,
            header_nslots,
            header_slot_bytes,
            require_hugepages,
            clock_domain,
            header_uri,
            pools,
        })
    }
}

// ============================================================================
// ConsumerHello / ConsumerConfig
// ============================================================================

/// Consumer -> supervisor: presence beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHello {
    pub epoch: u64,
    pub timestamp_ns: u64,
    pub stream_id: u32,
    pub consumer_id: u32,
}

impl ConsumerHello {
    const BLOCK: u16 = 24;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::CONSUMER_HELLO, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.timestamp_ns);
        w.put_u32(self.stream_id);
        w.put_u32(self.consumer_id);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        Ok(Self {
            epoch: r.u64()?,
            timestamp_ns: r.u64()?,
            stream_id: r.u32()?,
            consumer_id: r.u32()?,
        })
    }
}

/// Supervisor -> consumer: per-consumer routing assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream_id: u32,
    pub consumer_id: u32,
    pub descriptor_stream_id: u32,
    pub control_stream_id: u32,
    pub force_no_shm: bool,
    pub payload_fallback_uri: String,
}

impl ConsumerConfig {
    const BLOCK: u16 = 20;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::CONSUMER_CONFIG, Self::BLOCK);
        w.put_u32(self.stream_id);
        w.put_u32(self.consumer_id);
        w.put_u32(self.descriptor_stream_id);
        w.put_u32(self.control_stream_id);
        w.put_u8(u8::from(self.force_no_shm));
        w.put_u8(0);
        w.put_u16(0);
        w.put_str(&self.payload_fallback_uri)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let stream_id = r.u32()?;
        let consumer_id = r.u32()?;
        let descriptor_stream_id = r.u32()?;
        let control_stream_id = r.u32()?;
        let force_no_shm = r.u8()? != 0;
        r.skip_block(header);
        let payload_fallback_uri = r.str()?;
        Ok(Self {
            stream_id,
            consumer_id,
            descriptor_stream_id,
            control_stream_id,
            force_no_shm,
            payload_fallback_uri,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, Decoded, Message};

    fn round_trip(msg: Message) {
        let bytes = msg.encode().expect("encode failed");
        match decode_message(&bytes).expect("decode failed") {
            Decoded::Message(back) => assert_eq!(back, msg),
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn test_attach_request_round_trip() {
        round_trip(Message::AttachRequest(AttachRequest {
            correlation_id: -42,
            stream_id: 7,
            client_id: 1001,
            expected_layout_version: 1,
            desired_node_id: NULL_U32,
            role: Role::Producer,
            publish_mode: PublishMode::ExistingOrCreate,
            hugepages_policy: HugepagesPolicy::Standard,
        }));
    }

    #[test]
    fn test_attach_response_round_trip() {
        round_trip(Message::AttachResponse(AttachResponse {
            correlation_id: 9,
            code: ResponseCode::Ok,
            lease_id: 0xDEAD_BEEF,
            epoch: 1_700_000_000_000_000_000,
            keepalive_interval_ns: 1_000_000_000,
            stream_id: 7,
            layout_version: 1,
            header_nslots: 64,
            header_slot_bytes: 128,
            node_id: 0x1234_5678,
            error_message: String::new(),
            header_uri: "shm:file?path=/dev/shm/tp/7/1/header.ring|require_hugepages=false"
                .to_string(),
            pools: vec![
                PoolDescriptor {
                    pool_id: 0,
                    stride_bytes: 4096,
                    nslots: 64,
                    uri: "shm:file?path=/dev/shm/tp/7/1/0.pool|require_hugepages=false"
                        .to_string(),
                },
                PoolDescriptor {
                    pool_id: 1,
                    stride_bytes: 1 << 20,
                    nslots: 64,
                    uri: "shm:file?path=/dev/shm/tp/7/1/1.pool|require_hugepages=false"
                        .to_string(),
                },
            ],
        }));
    }

    #[test]
    fn test_attach_response_rejection() {
        round_trip(Message::AttachResponse(AttachResponse::error(
            3,
            ResponseCode::Rejected,
            "client_id already attached",
        )));
    }

    #[test]
    fn test_detach_round_trip() {
        round_trip(Message::DetachRequest(DetachRequest {
            correlation_id: 5,
            lease_id: 77,
            stream_id: 7,
            client_id: 1001,
            role: Role::Consumer,
        }));
        round_trip(Message::DetachResponse(DetachResponse {
            correlation_id: 5,
            code: ResponseCode::Ok,
            error_message: String::new(),
        }));
    }

    #[test]
    fn test_keepalive_and_revoked_round_trip() {
        round_trip(Message::LeaseKeepalive(LeaseKeepalive {
            lease_id: 77,
            stream_id: 7,
            client_id: 1001,
            role: Role::Producer,
        }));
        round_trip(Message::LeaseRevoked(LeaseRevoked {
            lease_id: 77,
            stream_id: 7,
            client_id: 1001,
            role: Role::Producer,
            reason: LeaseRevokeReason::Expired,
            message: "lease expired".to_string(),
        }));
    }

    #[test]
    fn test_shutdown_round_trip() {
        round_trip(Message::DriverShutdown(DriverShutdown {
            reason: ShutdownReason::Normal,
            message: String::new(),
        }));
    }

    #[test]
    fn test_announce_round_trip() {
        round_trip(Message::ShmPoolAnnounce(ShmPoolAnnounce {
            epoch: 123,
            timestamp_ns: 456,
            stream_id: 7,
            layout_version: 1,
            header_nslots: 4,
            header_slot_bytes: 128,
            require_hugepages: false,
            clock_domain: 1,
            header_uri: "shm:file?path=/tmp/h|require_hugepages=false".to_string(),
            pools: vec![PoolDescriptor {
                pool_id: 0,
                stride_bytes: 64,
                nslots: 4,
                uri: "shm:file?path=/tmp/p|require_hugepages=false".to_string(),
            }],
        }));
    }

    #[test]
    fn test_hello_config_round_trip() {
        round_trip(Message::ConsumerHello(ConsumerHello {
            epoch: 1,
            timestamp_ns: 2,
            stream_id: 7,
            consumer_id: 3,
        }));
        round_trip(Message::ConsumerConfig(ConsumerConfig {
            stream_id: 7,
            consumer_id: 3,
            descriptor_stream_id: 5003,
            control_stream_id: 6003,
            force_no_shm: false,
            payload_fallback_uri: String::new(),
        }));
    }

    #[test]
    fn test_truncated_attach_request_invalid() {
        let msg = AttachRequest {
            correlation_id: 1,
            stream_id: 1,
            client_id: 1,
            expected_layout_version: 0,
            desired_node_id: NULL_U32,
            role: Role::Consumer,
            publish_mode: PublishMode::ExistingOnly,
            hugepages_policy: HugepagesPolicy::Unspecified,
        };
        let bytes = msg.encode().expect("encode failed");
        assert!(decode_message(&bytes[..bytes.len() - 4]).is_err());
    }
}
