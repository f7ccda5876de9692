// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Data-plane side-band messages: frame descriptors, fill progress,
//! QoS counters, and data-source metadata.

use super::{template_id, MessageHeader, ProgressState, Reader, Writer};
use crate::error::Result;

/// Producer -> consumers: a frame was committed at `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub epoch: u64,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub stream_id: u32,
    pub slot_index: u32,
    pub payload_offset: u32,
    pub values_len_bytes: u32,
    pub meta_version: u32,
    pub pool_id: u16,
}

impl FrameDescriptor {
    const BLOCK: u16 = 48;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::FRAME_DESCRIPTOR, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.seq);
        w.put_u64(self.timestamp_ns);
        w.put_u32(self.stream_id);
        w.put_u32(self.slot_index);
        w.put_u32(self.payload_offset);
        w.put_u32(self.values_len_bytes);
        w.put_u32(self.meta_version);
        w.put_u16(self.pool_id);
        w.put_u16(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        Ok(Self {
            epoch: r.u64()?,
            seq: r.u64()?,
            timestamp_ns: r.u64()?,
            stream_id: r.u32()?,
            slot_index: r.u32()?,
            payload_offset: r.u32()?,
            values_len_bytes: r.u32()?,
            meta_version: r.u32()?,
            pool_id: r.u16()?,
        })
    }
}

/// Producer -> consumers: how much of frame `seq` is filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameProgress {
    pub epoch: u64,
    pub seq: u64,
    pub payload_bytes_filled: u64,
    pub stream_id: u32,
    pub state: ProgressState,
}

impl FrameProgress {
    const BLOCK: u16 = 32;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::FRAME_PROGRESS, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.seq);
        w.put_u64(self.payload_bytes_filled);
        w.put_u32(self.stream_id);
        w.put_u8(self.state as u8);
        w.put_u8(0);
        w.put_u16(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        Ok(Self {
            epoch: r.u64()?,
            seq: r.u64()?,
            payload_bytes_filled: r.u64()?,
            stream_id: r.u32()?,
            state: ProgressState::from_u8(r.u8()?)?,
        })
    }
}

/// Producer-side publish counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosProducer {
    pub epoch: u64,
    pub timestamp_ns: u64,
    pub frames_published: u64,
    pub bytes_published: u64,
    pub errors: u64,
    pub stream_id: u32,
}

impl QosProducer {
    const BLOCK: u16 = 48;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::QOS_PRODUCER, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.timestamp_ns);
        w.put_u64(self.frames_published);
        w.put_u64(self.bytes_published);
        w.put_u64(self.errors);
        w.put_u32(self.stream_id);
        w.put_u32(0);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        Ok(Self {
            epoch: r.u64()?,
            timestamp_ns: r.u64()?,
            frames_published: r.u64()?,
            bytes_published: r.u64()?,
            errors: r.u64()?,
            stream_id: r.u32()?,
        })
    }
}

/// Consumer-side read/drop counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosConsumer {
    pub epoch: u64,
    pub timestamp_ns: u64,
    pub frames_read: u64,
    pub drops_gap: u64,
    pub drops_late: u64,
    pub stream_id: u32,
    pub consumer_id: u32,
}

impl QosConsumer {
    const BLOCK: u16 = 48;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::QOS_CONSUMER, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.timestamp_ns);
        w.put_u64(self.frames_read);
        w.put_u64(self.drops_gap);
        w.put_u64(self.drops_late);
        w.put_u32(self.stream_id);
        w.put_u32(self.consumer_id);
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        Ok(Self {
            epoch: r.u64()?,
            timestamp_ns: r.u64()?,
            frames_read: r.u64()?,
            drops_gap: r.u64()?,
            drops_late: r.u64()?,
            stream_id: r.u32()?,
            consumer_id: r.u32()?,
        })
    }
}

/// Producer -> consumers: a data source exists under this stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceAnnounce {
    pub epoch: u64,
    pub stream_id: u32,
    pub meta_version: u32,
    pub name: String,
}

impl DataSourceAnnounce {
    const BLOCK: u16 = 16;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::DATA_SOURCE_ANNOUNCE, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u32(self.stream_id);
        w.put_u32(self.meta_version);
        w.put_str(&self.name)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let stream_id = r.u32()?;
        let meta_version = r.u32()?;
        r.skip_block(header);
        let name = r.str()?;
        Ok(Self {
            epoch,
            stream_id,
            meta_version,
            name,
        })
    }
}

/// One metadata key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaAttribute {
    pub key: String,
    pub value: String,
}

/// Producer -> consumers: versioned metadata with a repeating attribute
/// group; the demux surfaces it as begin / attr* / end callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceMeta {
    pub epoch: u64,
    pub stream_id: u32,
    pub meta_version: u32,
    pub attributes: Vec<MetaAttribute>,
}

impl DataSourceMeta {
    const BLOCK: u16 = 16;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::message(template_id::DATA_SOURCE_META, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u32(self.stream_id);
        w.put_u32(self.meta_version);
        w.group(0, self.attributes.len())?;
        for attr in &self.attributes {
            w.put_str(&attr.key)?;
            w.put_str(&attr.value)?;
        }
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let stream_id = r.u32()?;
        let meta_version = r.u32()?;
        r.skip_block(header);
        let (block, count) = r.group()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry_start = r.position();
            r.set_position(entry_start + block as usize)?;
            let key = r.str()?;
            let value = r.str()?;
            attributes.push(MetaAttribute { key, value });
        }
        Ok(Self {
            epoch,
            stream_id,
            meta_version,
            attributes,
        })
    }
}
