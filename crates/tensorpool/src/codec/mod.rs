// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Control-plane wire codec.
//!
//! Every message is a little-endian byte stream prefixed by an 8-byte
//! header:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     block_length  (bytes in the fixed-size body block)
//! 2       2     template_id
//! 4       2     schema_id
//! 6       2     version
//! ```
//!
//! The fixed block is followed by repeating groups (u16 block length +
//! u16 count, then entries) and var-length strings (u16 length + UTF-8
//! bytes). Decoding is versioned: messages with a newer-but-compatible
//! schema may grow the fixed block, so decoders skip to `block_length`
//! before reading groups; messages with a version above
//! [`SCHEMA_VERSION`] are rejected outright.
//!
//! This module is the only place in the crate that knows the encoding;
//! everything else works with the typed structs.

mod control;
mod data;
mod merge;
mod tracelink;

pub use control::{
    AttachRequest, AttachResponse, ConsumerConfig, ConsumerHello, DetachRequest, DetachResponse,
    DriverShutdown, LeaseKeepalive, LeaseRevoked, PoolDescriptor, ShmPoolAnnounce,
};
pub use data::{
    DataSourceAnnounce, DataSourceMeta, FrameDescriptor, FrameProgress, MetaAttribute,
    QosConsumer, QosProducer,
};
pub use merge::{
    SequenceMergeMap, SequenceMergeMapRequest, SequenceMergeRule, TimestampMergeMap,
    TimestampMergeMapRequest, TimestampMergeRule,
};
pub use tracelink::{TraceLinkSet, TRACELINK_MAX_PARENTS};

use crate::error::{Result, TpError};

/// Schema identifier carried by every TensorPool message.
pub const SCHEMA_ID: u16 = 0x5450; // "TP"

/// Highest schema version this build can decode.
pub const SCHEMA_VERSION: u16 = 1;

/// Encoded size of the message header.
pub const HEADER_LENGTH: usize = 8;

/// Null sentinel for optional u16 fields.
pub const NULL_U16: u16 = u16::MAX;
/// Null sentinel for optional u32 fields.
pub const NULL_U32: u32 = u32::MAX;
/// Null sentinel for optional u64 fields.
pub const NULL_U64: u64 = u64::MAX;

pub mod template_id {
    //! Template identifiers, one per wire message.
    pub const ATTACH_REQUEST: u16 = 1;
    pub const ATTACH_RESPONSE: u16 = 2;
    pub const DETACH_REQUEST: u16 = 3;
    pub const DETACH_RESPONSE: u16 = 4;
    pub const LEASE_KEEPALIVE: u16 = 5;
    pub const LEASE_REVOKED: u16 = 6;
    pub const DRIVER_SHUTDOWN: u16 = 7;
    pub const SHM_POOL_ANNOUNCE: u16 = 8;
    pub const CONSUMER_HELLO: u16 = 9;
    pub const CONSUMER_CONFIG: u16 = 10;
    pub const FRAME_DESCRIPTOR: u16 = 11;
    pub const FRAME_PROGRESS: u16 = 12;
    pub const QOS_PRODUCER: u16 = 13;
    pub const QOS_CONSUMER: u16 = 14;
    pub const DATA_SOURCE_ANNOUNCE: u16 = 15;
    pub const DATA_SOURCE_META: u16 = 16;
    pub const SEQUENCE_MERGE_MAP_ANNOUNCE: u16 = 17;
    pub const SEQUENCE_MERGE_MAP_REQUEST: u16 = 18;
    pub const TIMESTAMP_MERGE_MAP_ANNOUNCE: u16 = 19;
    pub const TIMESTAMP_MERGE_MAP_REQUEST: u16 = 20;
    pub const TRACE_LINK_SET: u16 = 21;
}

// ============================================================================
// Shared enums
// ============================================================================

/// Role a client attaches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Producer = 1,
    Consumer = 2,
}

impl Role {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Producer),
            2 => Ok(Self::Consumer),
            other => Err(TpError::invalid(format!("unknown role {other}"))),
        }
    }
}

/// Driver response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidParams = 1,
    Rejected = 2,
    InternalError = 3,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidParams),
            2 => Ok(Self::Rejected),
            3 => Ok(Self::InternalError),
            other => Err(TpError::invalid(format!("unknown response code {other}"))),
        }
    }
}

/// Whether an attach may create the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PublishMode {
    ExistingOnly = 1,
    #[default]
    ExistingOrCreate = 2,
}

impl PublishMode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::ExistingOnly),
            2 => Ok(Self::ExistingOrCreate),
            other => Err(TpError::invalid(format!("unknown publish mode {other}"))),
        }
    }
}

/// Page-size preference for the ring files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HugepagesPolicy {
    #[default]
    Unspecified = 0,
    Standard = 1,
    Hugepages = 2,
}

impl HugepagesPolicy {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::Standard),
            2 => Ok(Self::Hugepages),
            other => Err(TpError::invalid(format!("unknown hugepages policy {other}"))),
        }
    }
}

/// Why a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaseRevokeReason {
    Expired = 1,
    Detached = 2,
    Revoked = 3,
}

impl LeaseRevokeReason {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Expired),
            2 => Ok(Self::Detached),
            3 => Ok(Self::Revoked),
            other => Err(TpError::invalid(format!("unknown revoke reason {other}"))),
        }
    }
}

/// Why the driver is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownReason {
    Normal = 1,
    Error = 2,
}

impl ShutdownReason {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Normal),
            2 => Ok(Self::Error),
            other => Err(TpError::invalid(format!("unknown shutdown reason {other}"))),
        }
    }
}

/// Producer-reported frame fill state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgressState {
    Started = 1,
    Progress = 2,
    Complete = 3,
    Canceled = 4,
}

impl ProgressState {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Started),
            2 => Ok(Self::Progress),
            3 => Ok(Self::Complete),
            4 => Ok(Self::Canceled),
            other => Err(TpError::invalid(format!("unknown progress state {other}"))),
        }
    }
}

/// Which clock a timestamp rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimestampSource {
    FrameDescriptor = 1,
    SlotHeader = 2,
}

impl TimestampSource {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::FrameDescriptor),
            2 => Ok(Self::SlotHeader),
            other => Err(TpError::invalid(format!("unknown timestamp source {other}"))),
        }
    }
}

/// Sequence merge rule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergeRuleType {
    Offset = 1,
    Window = 2,
}

impl MergeRuleType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Offset),
            2 => Ok(Self::Window),
            other => Err(TpError::invalid(format!("unknown merge rule type {other}"))),
        }
    }
}

/// Timestamp merge rule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergeTimeRuleType {
    OffsetNs = 1,
    WindowNs = 2,
}

impl MergeTimeRuleType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::OffsetNs),
            2 => Ok(Self::WindowNs),
            other => Err(TpError::invalid(format!(
                "unknown merge time rule type {other}"
            ))),
        }
    }
}

// ============================================================================
// Message header
// ============================================================================

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LENGTH {
            return Err(TpError::invalid("message shorter than header"));
        }
        Ok(Self {
            block_length: u16::from_le_bytes([buf[0], buf[1]]),
            template_id: u16::from_le_bytes([buf[2], buf[3]]),
            schema_id: u16::from_le_bytes([buf[4], buf[5]]),
            version: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_length.to_le_bytes());
        out.extend_from_slice(&self.template_id.to_le_bytes());
        out.extend_from_slice(&self.schema_id.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
    }
}

// ============================================================================
// Buffer plumbing (crate-internal)
// ============================================================================

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Start a message: header with the given template and fixed block size.
    pub(crate) fn message(template_id: u16, block_length: u16) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LENGTH + block_length as usize);
        MessageHeader {
            block_length,
            template_id,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
        .encode(&mut buf);
        Self { buf }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Group header: entry block length + entry count.
    pub(crate) fn group(&mut self, block_length: u16, count: usize) -> Result<()> {
        let count = u16::try_from(count)
            .map_err(|_| TpError::invalid("group count exceeds u16 range"))?;
        self.put_u16(block_length);
        self.put_u16(count);
        Ok(())
    }

    /// Var-length UTF-8 string: u16 length prefix + bytes.
    pub(crate) fn put_str(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| TpError::invalid("string exceeds u16 length"))?;
        self.put_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Position a reader over a message body, validating the fixed block.
    ///
    /// `min_block` is the fixed-block size this build requires; a shorter
    /// block is a framing violation, a longer one is an additive extension
    /// and is skipped after the known fields are read.
    pub(crate) fn body(buf: &'a [u8], header: MessageHeader, min_block: u16) -> Result<Self> {
        if header.block_length < min_block {
            return Err(TpError::invalid(format!(
                "block length {} below required {}",
                header.block_length, min_block
            )));
        }
        if buf.len() < HEADER_LENGTH + header.block_length as usize {
            return Err(TpError::invalid("message truncated inside fixed block"));
        }
        Ok(Self {
            buf,
            pos: HEADER_LENGTH,
        })
    }

    /// Skip to the end of the fixed block (after the known fields).
    pub(crate) fn skip_block(&mut self, header: MessageHeader) {
        self.pos = HEADER_LENGTH + header.block_length as usize;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| TpError::invalid("message truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Group header; returns (entry block length, entry count).
    pub(crate) fn group(&mut self) -> Result<(u16, u16)> {
        let block = self.u16()?;
        let count = self.u16()?;
        Ok((block, count))
    }

    pub(crate) fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TpError::invalid("string is not valid UTF-8"))
    }

    /// Current offset into the message (for group entry skipping).
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(TpError::invalid("message truncated inside group"));
        }
        self.pos = pos;
        Ok(())
    }
}

// ============================================================================
// Top-level decode
// ============================================================================

/// Every decodable wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AttachRequest(AttachRequest),
    AttachResponse(AttachResponse),
    DetachRequest(DetachRequest),
    DetachResponse(DetachResponse),
    LeaseKeepalive(LeaseKeepalive),
    LeaseRevoked(LeaseRevoked),
    DriverShutdown(DriverShutdown),
    ShmPoolAnnounce(ShmPoolAnnounce),
    ConsumerHello(ConsumerHello),
    ConsumerConfig(ConsumerConfig),
    FrameDescriptor(FrameDescriptor),
    FrameProgress(FrameProgress),
    QosProducer(QosProducer),
    QosConsumer(QosConsumer),
    DataSourceAnnounce(DataSourceAnnounce),
    DataSourceMeta(DataSourceMeta),
    SequenceMergeMap(SequenceMergeMap),
    SequenceMergeMapRequest(SequenceMergeMapRequest),
    TimestampMergeMap(TimestampMergeMap),
    TimestampMergeMapRequest(TimestampMergeMapRequest),
    TraceLinkSet(TraceLinkSet),
}

impl Message {
    /// Encode this message to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::AttachRequest(m) => m.encode(),
            Self::AttachResponse(m) => m.encode(),
            Self::DetachRequest(m) => m.encode(),
            Self::DetachResponse(m) => m.encode(),
            Self::LeaseKeepalive(m) => m.encode(),
            Self::LeaseRevoked(m) => m.encode(),
            Self::DriverShutdown(m) => m.encode(),
            Self::ShmPoolAnnounce(m) => m.encode(),
            Self::ConsumerHello(m) => m.encode(),
            Self::ConsumerConfig(m) => m.encode(),
            Self::FrameDescriptor(m) => m.encode(),
            Self::FrameProgress(m) => m.encode(),
            Self::QosProducer(m) => m.encode(),
            Self::QosConsumer(m) => m.encode(),
            Self::DataSourceAnnounce(m) => m.encode(),
            Self::DataSourceMeta(m) => m.encode(),
            Self::SequenceMergeMap(m) => m.encode(),
            Self::SequenceMergeMapRequest(m) => m.encode(),
            Self::TimestampMergeMap(m) => m.encode(),
            Self::TimestampMergeMapRequest(m) => m.encode(),
            Self::TraceLinkSet(m) => m.encode(),
        }
    }

    /// Template id of this message.
    #[must_use]
    pub fn template_id(&self) -> u16 {
        use template_id as t;
        match self {
            Self::AttachRequest(_) => t::ATTACH_REQUEST,
            Self::AttachResponse(_) => t::ATTACH_RESPONSE,
            Self::DetachRequest(_) => t::DETACH_REQUEST,
            Self::DetachResponse(_) => t::DETACH_RESPONSE,
            Self::LeaseKeepalive(_) => t::LEASE_KEEPALIVE,
            Self::LeaseRevoked(_) => t::LEASE_REVOKED,
            Self::DriverShutdown(_) => t::DRIVER_SHUTDOWN,
            Self::ShmPoolAnnounce(_) => t::SHM_POOL_ANNOUNCE,
            Self::ConsumerHello(_) => t::CONSUMER_HELLO,
            Self::ConsumerConfig(_) => t::CONSUMER_CONFIG,
            Self::FrameDescriptor(_) => t::FRAME_DESCRIPTOR,
            Self::FrameProgress(_) => t::FRAME_PROGRESS,
            Self::QosProducer(_) => t::QOS_PRODUCER,
            Self::QosConsumer(_) => t::QOS_CONSUMER,
            Self::DataSourceAnnounce(_) => t::DATA_SOURCE_ANNOUNCE,
            Self::DataSourceMeta(_) => t::DATA_SOURCE_META,
            Self::SequenceMergeMap(_) => t::SEQUENCE_MERGE_MAP_ANNOUNCE,
            Self::SequenceMergeMapRequest(_) => t::SEQUENCE_MERGE_MAP_REQUEST,
            Self::TimestampMergeMap(_) => t::TIMESTAMP_MERGE_MAP_ANNOUNCE,
            Self::TimestampMergeMapRequest(_) => t::TIMESTAMP_MERGE_MAP_REQUEST,
            Self::TraceLinkSet(_) => t::TRACE_LINK_SET,
        }
    }
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A TensorPool message.
    Message(Message),
    /// Another protocol's schema; not an error.
    NotOurs,
    /// Our schema, but a template this build does not know.
    UnknownTemplate(u16),
}

/// Decode one message. Framing violations and over-version messages are
/// `Err(Invalid)`; foreign schemas and unknown templates are not errors.
pub fn decode_message(buf: &[u8]) -> Result<Decoded> {
    let header = MessageHeader::decode(buf)?;

    if header.schema_id != SCHEMA_ID {
        return Ok(Decoded::NotOurs);
    }
    if header.version > SCHEMA_VERSION {
        return Err(TpError::invalid(format!(
            "schema version {} above supported {}",
            header.version, SCHEMA_VERSION
        )));
    }

    use template_id as t;
    let msg = match header.template_id {
        t::ATTACH_REQUEST => Message::AttachRequest(AttachRequest::decode(buf, header)?),
        t::ATTACH_RESPONSE => Message::AttachResponse(AttachResponse::decode(buf, header)?),
        t::DETACH_REQUEST => Message::DetachRequest(DetachRequest::decode(buf, header)?),
        t::DETACH_RESPONSE => Message::DetachResponse(DetachResponse::decode(buf, header)?),
        t::LEASE_KEEPALIVE => Message::LeaseKeepalive(LeaseKeepalive::decode(buf, header)?),
        t::LEASE_REVOKED => Message::LeaseRevoked(LeaseRevoked::decode(buf, header)?),
        t::DRIVER_SHUTDOWN => Message::DriverShutdown(DriverShutdown::decode(buf, header)?),
        t::SHM_POOL_ANNOUNCE => Message::ShmPoolAnnounce(ShmPoolAnnounce::decode(buf, header)?),
        t::CONSUMER_HELLO => Message::ConsumerHello(ConsumerHello::decode(buf, header)?),
        t::CONSUMER_CONFIG => Message::ConsumerConfig(ConsumerConfig::decode(buf, header)?),
        t::FRAME_DESCRIPTOR => Message::FrameDescriptor(FrameDescriptor::decode(buf, header)?),
        t::FRAME_PROGRESS => Message::FrameProgress(FrameProgress::decode(buf, header)?),
        t::QOS_PRODUCER => Message::QosProducer(QosProducer::decode(buf, header)?),
        t::QOS_CONSUMER => Message::QosConsumer(QosConsumer::decode(buf, header)?),
        t::DATA_SOURCE_ANNOUNCE => {
            Message::DataSourceAnnounce(DataSourceAnnounce::decode(buf, header)?)
        }
        t::DATA_SOURCE_META => Message::DataSourceMeta(DataSourceMeta::decode(buf, header)?),
        t::SEQUENCE_MERGE_MAP_ANNOUNCE => {
            Message::SequenceMergeMap(SequenceMergeMap::decode(buf, header)?)
        }
        t::SEQUENCE_MERGE_MAP_REQUEST => {
            Message::SequenceMergeMapRequest(SequenceMergeMapRequest::decode(buf, header)?)
        }
        t::TIMESTAMP_MERGE_MAP_ANNOUNCE => {
            Message::TimestampMergeMap(TimestampMergeMap::decode(buf, header)?)
        }
        t::TIMESTAMP_MERGE_MAP_REQUEST => {
            Message::TimestampMergeMapRequest(TimestampMergeMapRequest::decode(buf, header)?)
        }
        t::TRACE_LINK_SET => Message::TraceLinkSet(TraceLinkSet::decode(buf, header)?),
        other => return Ok(Decoded::UnknownTemplate(other)),
    };

    Ok(Decoded::Message(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut buf = Vec::new();
        let h = MessageHeader {
            block_length: 24,
            template_id: 7,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        };
        h.encode(&mut buf);
        assert_eq!(MessageHeader::decode(&buf).expect("decode failed"), h);
    }

    #[test]
    fn test_foreign_schema_not_ours() {
        let mut buf = Vec::new();
        MessageHeader {
            block_length: 0,
            template_id: 1,
            schema_id: 0xBEEF,
            version: 1,
        }
        .encode(&mut buf);
        assert_eq!(decode_message(&buf).expect("decode failed"), Decoded::NotOurs);
    }

    #[test]
    fn test_over_version_rejected() {
        let mut buf = Vec::new();
        MessageHeader {
            block_length: 0,
            template_id: 1,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION + 1,
        }
        .encode(&mut buf);
        assert!(decode_message(&buf).is_err());
    }

    #[test]
    fn test_unknown_template_surfaced() {
        let mut buf = Vec::new();
        MessageHeader {
            block_length: 0,
            template_id: 9999,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
        .encode(&mut buf);
        assert_eq!(
            decode_message(&buf).expect("decode failed"),
            Decoded::UnknownTemplate(9999)
        );
    }

    #[test]
    fn test_short_buffer_invalid() {
        assert!(decode_message(&[1, 2, 3]).is_err());
    }
}
