// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Trace-link messages.
//!
//! A `TraceLinkSet` relates a trace id to one or more parent trace ids for
//! a given (stream, epoch, seq). One parent makes the trace id an alias of
//! the parent; more than one declares a new trace id joining its parents.

use super::{template_id, MessageHeader, Reader, Writer};
use crate::error::{Result, TpError};

/// Upper bound on parents in one set.
pub const TRACELINK_MAX_PARENTS: usize = 256;

/// Provenance link between a frame's trace id and its parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLinkSet {
    pub stream_id: u32,
    pub epoch: u64,
    pub seq: u64,
    pub trace_id: u64,
    pub parents: Vec<u64>,
}

impl TraceLinkSet {
    const BLOCK: u16 = 32;
    const PARENT_BLOCK: u16 = 8;

    /// True when this set merely aliases a single parent trace.
    #[must_use]
    pub fn is_alias(&self) -> bool {
        self.parents.len() == 1
    }

    fn validate(&self) -> Result<()> {
        if self.trace_id == 0 {
            return Err(TpError::invalid("trace_id must be non-zero"));
        }
        if self.parents.is_empty() {
            return Err(TpError::invalid("trace link needs at least one parent"));
        }
        if self.parents.len() > TRACELINK_MAX_PARENTS {
            return Err(TpError::invalid(format!(
                "trace link parent count {} above {TRACELINK_MAX_PARENTS}",
                self.parents.len()
            )));
        }
        for (i, &parent) in self.parents.iter().enumerate() {
            if parent == 0 {
                return Err(TpError::invalid("trace link parent must be non-zero"));
            }
            if self.parents[..i].contains(&parent) {
                return Err(TpError::invalid(format!(
                    "duplicate trace link parent {parent}"
                )));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut w = Writer::message(template_id::TRACE_LINK_SET, Self::BLOCK);
        w.put_u64(self.epoch);
        w.put_u64(self.seq);
        w.put_u64(self.trace_id);
        w.put_u32(self.stream_id);
        w.put_u32(0);
        w.group(Self::PARENT_BLOCK, self.parents.len())?;
        for &parent in &self.parents {
            w.put_u64(parent);
        }
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], header: MessageHeader) -> Result<Self> {
        let mut r = Reader::body(buf, header, Self::BLOCK)?;
        let epoch = r.u64()?;
        let seq = r.u64()?;
        let trace_id = r.u64()?;
        let stream_id = r.u32()?;
        r.skip_block(header);
        let (block, count) = r.group()?;
        if block < Self::PARENT_BLOCK {
            return Err(TpError::invalid("trace link parent block too short"));
        }
        let mut parents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry_start = r.position();
            parents.push(r.u64()?);
            r.set_position(entry_start + block as usize)?;
        }
        let set = Self {
            stream_id,
            epoch,
            seq,
            trace_id,
            parents,
        };
        set.validate()?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, Decoded, Message};

    fn base() -> TraceLinkSet {
        TraceLinkSet {
            stream_id: 10,
            epoch: 1,
            seq: 2,
            trace_id: 100,
            parents: vec![11, 22],
        }
    }

    #[test]
    fn test_round_trip_two_parents() {
        let msg = Message::TraceLinkSet(base());
        let bytes = msg.encode().expect("encode failed");
        match decode_message(&bytes).expect("decode failed") {
            Decoded::Message(back) => assert_eq!(back, msg),
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn test_alias_single_parent() {
        let set = TraceLinkSet {
            parents: vec![11],
            ..base()
        };
        assert!(set.is_alias());
        set.encode().expect("encode failed");
    }

    #[test]
    fn test_duplicate_parent_rejected() {
        let set = TraceLinkSet {
            parents: vec![11, 11],
            ..base()
        };
        assert!(set.encode().is_err());
    }

    #[test]
    fn test_zero_parent_rejected() {
        let set = TraceLinkSet {
            parents: vec![11, 0],
            ..base()
        };
        assert!(set.encode().is_err());
    }

    #[test]
    fn test_zero_trace_id_rejected() {
        let set = TraceLinkSet {
            trace_id: 0,
            ..base()
        };
        assert!(set.encode().is_err());
    }

    #[test]
    fn test_empty_parents_rejected() {
        let set = TraceLinkSet {
            parents: Vec::new(),
            ..base()
        };
        assert!(set.encode().is_err());
    }

    #[test]
    fn test_too_many_parents_rejected() {
        let set = TraceLinkSet {
            parents: (1..=(TRACELINK_MAX_PARENTS as u64 + 1)).collect(),
            ..base()
        };
        assert!(set.encode().is_err());
    }
}
