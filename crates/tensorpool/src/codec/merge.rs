// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Merge-map announce and request messages.
//!
//! A merge map declares, per upstream input, the rule under which a join
//! barrier considers that input satisfied. Rules are validated on both
//! encode and decode: a window of zero is meaningless and rejected.

use super::{
    template_id, MergeRuleType, MergeTimeRuleType, MessageHeader, Reader, TimestampSource,
    Writer, NULL_U64,
};
use crate::error::{Result, TpError};

/// Readiness rule for one input of a sequence merge map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMergeRule {
    pub input_stream_id: u32,
    pub rule_type: MergeRuleType,
    pub offset: i32,
    pub window_size: u32,
}

impl SequenceMergeRule {
    fn validate(&self) -> Result<()> {
        if self.rule_type == MergeRuleType::Window && self.window_size == 0 {
            return Err(TpError::invalid("sequence window rule with zero window"));
        }
        Ok(())
    }
}

/// Readiness rule for one input of a timestamp merge map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampMergeRule {
    pub input_stream_id: u32,
    pub rule_type: MergeTimeRuleType,
    pub timestamp_source: TimestampSource,
    pub offset_ns: i64,
    pub window_ns: u64,
}

impl TimestampMergeRule {
    fn validate(&self) -> Result<()> {
        if self.rule_type == MergeTimeRuleType::WindowNs && self.window_ns == 0 {
            return Err(TpError::invalid("timestamp window rule with zero window"));
        }
        Ok(())
    }
}

/// Sequence-based merge map for one output stream and epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceMergeMap {
    pub out_stream_id: u32,
    pub epoch: u64,
    /// `NULL_U64` means "no stale cutoff".
    pub stale_timeout_ns: u64,
    pub rules: Vec<SequenceMergeRule>,
}

impl SequenceMergeMap {
    const BLOCK: u16 = 24;
    const RULE_BLOCK: u16 = 16;

    pub fn encode(&self) -> Result<Vec<u8>> {
        for rule in &self.rules {
            rule.validate()?;
        }
        let mut w = Writer::message(template_id::SEQUENCE_MERGE_MAP_ANNOUNCE, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.stale_timeout_ns);
        w.put_u32(self.out_stream_id);
        w.put_u32(0);
        w.group(Self::RULE_BLOCK, self.rules.len())?;
        for rule in &self.rules {
            w.put_u32(rule.input_stream_id);
            w.put_i32(rule.offset);
            w.put_u32(rule.window_size);
            w.put_u8(rule.rule_type as u8);
            w.put_u8(0);
            w.put_u16(0);
        }
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let stale_timeout_ns = r.u64()?;
        let out_stream_id = r.u32()?;
        r.skip_block(header);
        let (block, count) = r.group()?;
        if block < Self::RULE_BLOCK {
            return Err(TpError::invalid("sequence rule block too short"));
        }
        let mut rules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry_start = r.position();
            let input_stream_id = r.u32()?;
            let offset = r.i32()?;
            let window_size = r.u32()?;
            let rule_type = MergeRuleType::from_u8(r.u8()?)?;
            r.set_position(entry_start + block as usize)?;
            let rule = SequenceMergeRule {
                input_stream_id,
                rule_type,
                offset,
                window_size,
            };
            rule.validate()?;
            rules.push(rule);
        }
        Ok(Self {
            out_stream_id,
            epoch,
            stale_timeout_ns,
            rules,
        })
    }
}

/// Timestamp-based merge map for one output stream and epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampMergeMap {
    pub out_stream_id: u32,
    pub epoch: u64,
    /// `NULL_U64` means "no stale cutoff".
    pub stale_timeout_ns: u64,
    /// `NULL_U64` means "no lateness allowance".
    pub lateness_ns: u64,
    pub clock_domain: u8,
    pub rules: Vec<TimestampMergeRule>,
}

impl TimestampMergeMap {
    const BLOCK: u16 = 32;
    const RULE_BLOCK: u16 = 24;

    pub fn encode(&self) -> Result<Vec<u8>> {
        for rule in &self.rules {
            rule.validate()?;
        }
        let mut w = Writer::message(template_id::TIMESTAMP_MERGE_MAP_ANNOUNCE, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.stale_timeout_ns);
        w.put_u64(self.lateness_ns);
        w.put_u32(self.out_stream_id);
        w.put_u8(self.clock_domain);
        w.put_u8(0);
        w.put_u16(0);
        w.group(Self::RULE_BLOCK, self.rules.len())?;
        for rule in &self.rules {
            w.put_i64(rule.offset_ns);
            w.put_u64(rule.window_ns);
            w.put_u32(rule.input_stream_id);
            w.put_u8(rule.rule_type as u8);
            w.put_u8(rule.timestamp_source as u8);
            w.put_u16(0);
        }
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let stale_timeout_ns = r.u64()?;
        let lateness_ns = r.u64()?;
        let out_stream_id = r.u32()?;
        let clock_domain = r.u8()?;
        r.skip_block(header);
        let (block, count) = r.group()?;
        if block < Self::RULE_BLOCK {
            return Err(TpError::invalid("timestamp rule block too short"));
        }
        let mut rules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry_start = r.position();
            let offset_ns = r.i64()?;
            let window_ns = r.u64()?;
            let input_stream_id = r.u32()?;
            let rule_type = MergeTimeRuleType::from_u8(r.u8()?)?;
            let timestamp_source = TimestampSource::from_u8(r.u8()?)?;
            r.set_position(entry_start + block as usize)?;
            let rule = TimestampMergeRule {
                input_stream_id,
                rule_type,
                timestamp_source,
                offset_ns,
                window_ns,
            };
            rule.validate()?;
            rules.push(rule);
        }
        Ok(Self {
            out_stream_id,
            epoch,
            stale_timeout_ns,
            lateness_ns,
            clock_domain,
            rules,
        })
    }
}

fn encode_map_request(template: u16, out_stream_id: u32, epoch: u64) -> Result<Vec<u8>> {
    let mut w = Writer::message(template, 16);
    w.put_u64(epoch);
    w.put_u32(out_stream_id);
    w.put_u32(0);
    Ok(w.finish())
}

fn decode_map_request(buf: &[u8], header: MessageHeader) -> Result<(u32, u64)> {
    let mut r = Reader::body(buf, header, 16)?;
    let epoch = r.u64()?;
    let out_stream_id = r.u32()?;
    Ok((out_stream_id, epoch))
}

/// Consumer -> producer: please re-announce the sequence merge map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMergeMapRequest {
    pub out_stream_id: u32,
    pub epoch: u64,
}

impl SequenceMergeMapRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_map_request(
            template_id::SEQUENCE_MERGE_MAP_REQUEST,
            self.out_stream_id,
            self.epoch,
        )
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let (out_stream_id, epoch) = decode_map_request(buf, header)?;
        Ok(Self {
            out_stream_id,
            epoch,
        })
    }
}

/// Consumer -> producer: please re-announce the timestamp merge map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampMergeMapRequest {
    pub out_stream_id: u32,
    pub epoch: u64,
}

impl TimestampMergeMapRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_map_request(
            template_id::TIMESTAMP_MERGE_MAP_REQUEST,
            self.out_stream_id,
            self.epoch,
        )
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let (out_stream_id, epoch) = decode_map_request(buf, header)?;
        Ok(Self {
            out_stream_id,
            epoch,
        })
    }
}

impl Default for SequenceMergeMap {
    fn default() -> Self {
        Self {
            out_stream_id: 0,
            epoch: 0,
            stale_timeout_ns: NULL_U64,
            rules: Vec::new(),
        }
    }
}

impl Default for TimestampMergeMap {
    fn default() -> Self {
        Self {
            out_stream_id: 0,
            epoch: 0,
            stale_timeout_ns: NULL_U64,
            lateness_ns: NULL_U64,
            clock_domain: 0,
            rules: Vec::new(),
        }
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
    fn test_sequence_map_round_trip() {
        round_trip(Message::SequenceMergeMap(SequenceMergeMap {
            out_stream_id: 30,
            epoch: 5,
            stale_timeout_ns: 2_000_000_000,
            rules: vec![
                SequenceMergeRule {
                    input_stream_id: 10,
                    rule_type: MergeRuleType::Offset,
                    offset: 0,
                    window_size: 0,
                },
                SequenceMergeRule {
                    input_stream_id: 11,
                    rule_type: MergeRuleType::Window,
                    offset: 0,
                    window_size: 4,
                },
            ],
        }));
    }

    #[test]
    fn test_sequence_map_negative_offset() {
        round_trip(Message::SequenceMergeMap(SequenceMergeMap {
            out_stream_id: 30,
            epoch: 5,
            stale_timeout_ns: NULL_U64,
            rules: vec![SequenceMergeRule {
                input_stream_id: 10,
                rule_type: MergeRuleType::Offset,
                offset: -3,
                window_size: 0,
            }],
        }));
    }

    #[test]
    fn test_timestamp_map_round_trip() {
        round_trip(Message::TimestampMergeMap(TimestampMergeMap {
            out_stream_id: 31,
            epoch: 9,
            stale_timeout_ns: 1_000_000_000,
            lateness_ns: 5_000_000,
            clock_domain: 2,
            rules: vec![TimestampMergeRule {
                input_stream_id: 12,
                rule_type: MergeTimeRuleType::OffsetNs,
                timestamp_source: TimestampSource::SlotHeader,
                offset_ns: -1_000_000,
                window_ns: 0,
            }],
        }));
    }

    #[test]
    fn test_zero_window_rejected() {
        let map = SequenceMergeMap {
            out_stream_id: 1,
            epoch: 1,
            stale_timeout_ns: NULL_U64,
            rules: vec![SequenceMergeRule {
                input_stream_id: 2,
                rule_type: MergeRuleType::Window,
                offset: 0,
                window_size: 0,
            }],
        };
        assert!(map.encode().is_err());

        let map = TimestampMergeMap {
            rules: vec![TimestampMergeRule {
                input_stream_id: 2,
                rule_type: MergeTimeRuleType::WindowNs,
                timestamp_source: TimestampSource::FrameDescriptor,
                offset_ns: 0,
                window_ns: 0,
            }],
            ..TimestampMergeMap::default()
        };
        assert!(map.encode().is_err());
    }

    #[test]
    fn test_map_requests_round_trip() {
        round_trip(Message::SequenceMergeMapRequest(SequenceMergeMapRequest {
            out_stream_id: 30,
            epoch: 5,
        }));
        round_trip(Message::TimestampMergeMapRequest(
            TimestampMergeMapRequest {
                out_stream_id: 31,
                epoch: 6,
            },
        ));
    }
}
