// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 TensorPool contributors

//! Join barriers: declarative readiness gating for downstream streams.
//!
//! A barrier owns one rule and one input-state entry per upstream input.
//! Applying a merge map clears the state and loads the new rules; updates
//! feed observed/processed sequence or time per input and reject
//! regressions; readiness asks whether every non-stale input satisfies
//! its rule for a proposed output position.

mod registry;

pub use registry::{MergeMapKind, MergeMapRegistry};

use crate::codec::{
    MergeRuleType, MergeTimeRuleType, SequenceMergeMap, SequenceMergeRule, TimestampMergeMap,
    TimestampMergeRule, TimestampSource, NULL_U64,
};
use crate::error::{Result, TpError};

/// What a barrier gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Sequence,
    Timestamp,
    LatestValue,
}

/// Which axis `collect_latest` orders selections by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatestOrdering {
    #[default]
    Sequence,
    Timestamp,
}

/// Most recent accepted update for one input of a latest-value barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestSelection {
    pub stream_id: u32,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub timestamp_source: Option<TimestampSource>,
}

#[derive(Debug, Clone, Copy, Default)]
struct InputState {
    stream_id: u32,
    timestamp_source: Option<TimestampSource>,
    observed_seq: u64,
    processed_seq: u64,
    observed_time_ns: u64,
    processed_time_ns: u64,
    last_observed_update_ns: u64,
    last_processed_update_ns: u64,
    has_observed_seq: bool,
    has_processed_seq: bool,
    has_observed_time: bool,
    has_processed_time: bool,
}

/// Readiness engine for one output stream.
pub struct JoinBarrier {
    kind: BarrierKind,
    out_stream_id: u32,
    epoch: u64,
    stale_timeout_ns: Option<u64>,
    lateness_ns: Option<u64>,
    clock_domain: u8,
    allow_stale: bool,
    require_processed: bool,
    latest_ordering: LatestOrdering,
    rule_capacity: usize,
    sequence_rules: Vec<SequenceMergeRule>,
    timestamp_rules: Vec<TimestampMergeRule>,
    inputs: Vec<InputState>,
}

fn optional(value: u64) -> Option<u64> {
    (value != NULL_U64).then_some(value)
}

impl JoinBarrier {
    /// Rule capacity is fixed for the barrier's lifetime; applying a map
    /// with more rules fails.
    pub fn new(kind: BarrierKind, rule_capacity: usize) -> Result<Self> {
        if rule_capacity == 0 {
            return Err(TpError::invalid("barrier needs a non-zero rule capacity"));
        }
        Ok(Self {
            kind,
            out_stream_id: 0,
            epoch: 0,
            stale_timeout_ns: None,
            lateness_ns: None,
            clock_domain: 0,
            allow_stale: false,
            require_processed: false,
            latest_ordering: LatestOrdering::default(),
            rule_capacity,
            sequence_rules: Vec::with_capacity(rule_capacity),
            timestamp_rules: Vec::with_capacity(rule_capacity),
            inputs: Vec::with_capacity(rule_capacity),
        })
    }

    pub fn set_allow_stale(&mut self, allow_stale: bool) {
        self.allow_stale = allow_stale;
    }

    pub fn set_require_processed(&mut self, require_processed: bool) {
        self.require_processed = require_processed;
    }

    pub fn set_latest_ordering(&mut self, ordering: LatestOrdering) {
        self.latest_ordering = ordering;
    }

    #[must_use]
    pub fn kind(&self) -> BarrierKind {
        self.kind
    }

    #[must_use]
    pub fn out_stream_id(&self) -> u32 {
        self.out_stream_id
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.inputs.len()
    }

    fn clear(&mut self) {
        self.out_stream_id = 0;
        self.epoch = 0;
        self.stale_timeout_ns = None;
        self.lateness_ns = None;
        self.clock_domain = 0;
        self.sequence_rules.clear();
        self.timestamp_rules.clear();
        self.inputs.clear();
    }

    fn check_capacity(&self, rule_count: usize) -> Result<()> {
        if rule_count > self.rule_capacity {
            return Err(TpError::invalid(format!(
                "map has {rule_count} rules, barrier capacity {}",
                self.rule_capacity
            )));
        }
        Ok(())
    }

    fn load_sequence(&mut self, map: &SequenceMergeMap) {
        self.clear();
        self.out_stream_id = map.out_stream_id;
        self.epoch = map.epoch;
        self.stale_timeout_ns = optional(map.stale_timeout_ns);
        self.sequence_rules.extend_from_slice(&map.rules);
        self.inputs.extend(map.rules.iter().map(|rule| InputState {
            stream_id: rule.input_stream_id,
            ..InputState::default()
        }));
    }

    fn load_timestamp(&mut self, map: &TimestampMergeMap) {
        self.clear();
        self.out_stream_id = map.out_stream_id;
        self.epoch = map.epoch;
        self.stale_timeout_ns = optional(map.stale_timeout_ns);
        self.lateness_ns = Some(optional(map.lateness_ns).unwrap_or(0));
        self.clock_domain = map.clock_domain;
        self.timestamp_rules.extend_from_slice(&map.rules);
        self.inputs.extend(map.rules.iter().map(|rule| InputState {
            stream_id: rule.input_stream_id,
            timestamp_source: Some(rule.timestamp_source),
            ..InputState::default()
        }));
    }

    /// Replace the rule set of a sequence barrier.
    pub fn apply_sequence_map(&mut self, map: &SequenceMergeMap) -> Result<()> {
        self.check_capacity(map.rules.len())?;
        if self.kind != BarrierKind::Sequence {
            return Err(TpError::invalid("barrier type mismatch for sequence map"));
        }
        self.load_sequence(map);
        Ok(())
    }

    /// Replace the rule set of a timestamp barrier.
    pub fn apply_timestamp_map(&mut self, map: &TimestampMergeMap) -> Result<()> {
        self.check_capacity(map.rules.len())?;
        if self.kind != BarrierKind::Timestamp {
            return Err(TpError::invalid("barrier type mismatch for timestamp map"));
        }
        self.load_timestamp(map);
        Ok(())
    }

    /// Replace the rule set of a latest-value barrier from a sequence map.
    pub fn apply_latest_value_sequence_map(&mut self, map: &SequenceMergeMap) -> Result<()> {
        self.check_capacity(map.rules.len())?;
        if self.kind != BarrierKind::LatestValue {
            return Err(TpError::invalid(
                "barrier type mismatch for latest-value map",
            ));
        }
        self.load_sequence(map);
        Ok(())
    }

    /// Replace the rule set of a latest-value barrier from a timestamp map.
    pub fn apply_latest_value_timestamp_map(&mut self, map: &TimestampMergeMap) -> Result<()> {
        self.check_capacity(map.rules.len())?;
        if self.kind != BarrierKind::LatestValue {
            return Err(TpError::invalid(
                "barrier type mismatch for latest-value map",
            ));
        }
        self.load_timestamp(map);
        Ok(())
    }

    fn input_mut(&mut self, stream_id: u32) -> Result<&mut InputState> {
        self.inputs
            .iter_mut()
            .find(|s| s.stream_id == stream_id)
            .ok_or_else(|| TpError::invalid(format!("stream {stream_id} not tracked")))
    }

    /// Record an observed sequence for `stream_id`; regressions fail.
    pub fn update_observed_seq(&mut self, stream_id: u32, seq: u64, now_ns: u64) -> Result<()> {
        let state = self.input_mut(stream_id)?;
        if state.has_observed_seq && seq < state.observed_seq {
            return Err(TpError::invalid(format!(
                "observed seq regression on stream {stream_id}: {seq} < {}",
                state.observed_seq
            )));
        }
        state.observed_seq = seq;
        state.has_observed_seq = true;
        state.last_observed_update_ns = now_ns;
        Ok(())
    }

    /// Record a processed sequence for `stream_id`; regressions fail.
    pub fn update_processed_seq(&mut self, stream_id: u32, seq: u64, now_ns: u64) -> Result<()> {
        let state = self.input_mut(stream_id)?;
        if state.has_processed_seq && seq < state.processed_seq {
            return Err(TpError::invalid(format!(
                "processed seq regression on stream {stream_id}: {seq} < {}",
                state.processed_seq
            )));
        }
        state.processed_seq = seq;
        state.has_processed_seq = true;
        state.last_processed_update_ns = now_ns;
        Ok(())
    }

    fn validate_time_update(
        &self,
        state: &InputState,
        source: TimestampSource,
        clock_domain: u8,
    ) -> Result<()> {
        if self.clock_domain != 0 && clock_domain != self.clock_domain {
            return Err(TpError::invalid(format!(
                "clock domain {clock_domain} != barrier domain {}",
                self.clock_domain
            )));
        }
        if let Some(expected) = state.timestamp_source {
            if source != expected {
                return Err(TpError::invalid("timestamp source mismatch"));
            }
        }
        Ok(())
    }

    /// Record an observed timestamp for `stream_id`; regressions fail.
    pub fn update_observed_time(
        &mut self,
        stream_id: u32,
        timestamp_ns: u64,
        source: TimestampSource,
        clock_domain: u8,
        now_ns: u64,
    ) -> Result<()> {
        if timestamp_ns == NULL_U64 {
            return Err(TpError::invalid("observed timestamp missing"));
        }
        let this = &*self;
        let state = this
            .inputs
            .iter()
            .find(|s| s.stream_id == stream_id)
            .ok_or_else(|| TpError::invalid(format!("stream {stream_id} not tracked")))?;
        this.validate_time_update(state, source, clock_domain)?;

        let state = self.input_mut(stream_id)?;
        if state.has_observed_time && timestamp_ns < state.observed_time_ns {
            return Err(TpError::invalid(format!(
                "observed time regression on stream {stream_id}"
            )));
        }
        state.observed_time_ns = timestamp_ns;
        state.has_observed_time = true;
        state.last_observed_update_ns = now_ns;
        Ok(())
    }

    /// Record a processed timestamp for `stream_id`; regressions fail.
    pub fn update_processed_time(
        &mut self,
        stream_id: u32,
        timestamp_ns: u64,
        source: TimestampSource,
        clock_domain: u8,
        now_ns: u64,
    ) -> Result<()> {
        if timestamp_ns == NULL_U64 {
            return Err(TpError::invalid("processed timestamp missing"));
        }
        let this = &*self;
        let state = this
            .inputs
            .iter()
            .find(|s| s.stream_id == stream_id)
            .ok_or_else(|| TpError::invalid(format!("stream {stream_id} not tracked")))?;
        this.validate_time_update(state, source, clock_domain)?;

        let state = self.input_mut(stream_id)?;
        if state.has_processed_time && timestamp_ns < state.processed_time_ns {
            return Err(TpError::invalid(format!(
                "processed time regression on stream {stream_id}"
            )));
        }
        state.processed_time_ns = timestamp_ns;
        state.has_processed_time = true;
        state.last_processed_update_ns = now_ns;
        Ok(())
    }

    fn is_stale(&self, state: &InputState, now_ns: u64) -> bool {
        let Some(timeout) = self.stale_timeout_ns else {
            return false;
        };
        if !self.allow_stale || state.last_observed_update_ns == 0 {
            return false;
        }
        now_ns.saturating_sub(state.last_observed_update_ns) > timeout
    }

    /// Inputs currently beyond the stale timeout.
    #[must_use]
    pub fn collect_stale_inputs(&self, now_ns: u64) -> Vec<u32> {
        if !self.allow_stale || self.stale_timeout_ns.is_none() {
            return Vec::new();
        }
        self.inputs
            .iter()
            .filter(|s| self.is_stale(s, now_ns))
            .map(|s| s.stream_id)
            .collect()
    }

    /// Sequence readiness for `out_seq`.
    pub fn is_ready_sequence(&self, out_seq: u64, now_ns: u64) -> Result<bool> {
        if self.kind != BarrierKind::Sequence {
            return Err(TpError::invalid("not a sequence barrier"));
        }
        if self.inputs.is_empty() {
            return Ok(false);
        }

        for (rule, state) in self.sequence_rules.iter().zip(&self.inputs) {
            if self.is_stale(state, now_ns) {
                continue;
            }
            if !state.has_observed_seq {
                return Ok(false);
            }

            let required_seq = match rule.rule_type {
                MergeRuleType::Offset => {
                    let required = out_seq as i64 + i64::from(rule.offset);
                    if required < 0 {
                        // Negative offsets block until out_seq catches up.
                        return Ok(false);
                    }
                    required as u64
                }
                MergeRuleType::Window => {
                    if rule.window_size == 0 {
                        return Ok(false);
                    }
                    if out_seq + 1 < u64::from(rule.window_size) {
                        return Ok(false);
                    }
                    out_seq
                }
            };

            if state.observed_seq < required_seq {
                return Ok(false);
            }
            if self.require_processed
                && (!state.has_processed_seq || state.processed_seq < required_seq)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn timestamp_rule_ready(
        &self,
        state: &InputState,
        rule: &TimestampMergeRule,
        out_time_ns: u64,
    ) -> Result<bool> {
        let lateness = self.lateness_ns.unwrap_or(0);

        if !state.has_observed_time {
            return Ok(false);
        }

        let required_time = match rule.rule_type {
            MergeTimeRuleType::OffsetNs => {
                let required = out_time_ns as i64 + rule.offset_ns;
                if required < 0 {
                    // Lateness offsets the clamp at zero.
                    let mut threshold = lateness;
                    if rule.offset_ns < 0 {
                        threshold += rule.offset_ns.unsigned_abs();
                    }
                    if out_time_ns < threshold {
                        return Ok(false);
                    }
                    0
                } else {
                    required as u64
                }
            }
            MergeTimeRuleType::WindowNs => {
                if rule.window_ns == 0 {
                    return Err(TpError::invalid("timestamp window rule with zero window"));
                }
                if out_time_ns < rule.window_ns {
                    return Ok(false);
                }
                out_time_ns
            }
        };

        if state.observed_time_ns + lateness < required_time {
            return Ok(false);
        }
        if self.require_processed
            && (!state.has_processed_time || state.processed_time_ns + lateness < required_time)
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Timestamp readiness for `out_time_ns`.
    pub fn is_ready_timestamp(
        &self,
        out_time_ns: u64,
        clock_domain: u8,
        now_ns: u64,
    ) -> Result<bool> {
        if self.kind != BarrierKind::Timestamp {
            return Err(TpError::invalid("not a timestamp barrier"));
        }
        if self.inputs.is_empty() {
            return Ok(false);
        }
        if self.clock_domain != 0 && clock_domain != self.clock_domain {
            return Err(TpError::invalid("clock domain mismatch"));
        }

        for (rule, state) in self.timestamp_rules.iter().zip(&self.inputs) {
            if self.is_stale(state, now_ns) {
                continue;
            }
            if !self.timestamp_rule_ready(state, rule, out_time_ns)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Latest-value readiness: every non-stale input has at least one
    /// accepted update.
    pub fn is_ready_latest(
        &self,
        _out_seq: u64,
        out_time_ns: u64,
        clock_domain: u8,
        now_ns: u64,
    ) -> Result<bool> {
        if self.kind != BarrierKind::LatestValue {
            return Err(TpError::invalid("not a latest-value barrier"));
        }
        if self.inputs.is_empty() {
            return Ok(false);
        }

        for state in &self.inputs {
            if self.is_stale(state, now_ns) {
                continue;
            }
            if self.clock_domain != 0 && clock_domain != self.clock_domain {
                return Err(TpError::invalid("clock domain mismatch"));
            }
            if !state.has_observed_seq && !state.has_observed_time {
                return Ok(false);
            }
            if self.clock_domain != 0 && !state.has_observed_time {
                return Ok(false);
            }
            if state.has_observed_time && state.observed_time_ns > 0 && out_time_ns == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Forget updates for `stream_id`, re-arming latest-value readiness.
    pub fn invalidate_latest(&mut self, stream_id: u32) -> Result<()> {
        if self.kind != BarrierKind::LatestValue {
            return Err(TpError::invalid("not a latest-value barrier"));
        }
        let state = self.input_mut(stream_id)?;
        let keep = InputState {
            stream_id: state.stream_id,
            timestamp_source: state.timestamp_source,
            ..InputState::default()
        };
        *state = keep;
        Ok(())
    }

    /// Most recent accepted selection per input that has one, ordered by
    /// the configured axis (most recent first).
    pub fn collect_latest(&self) -> Result<Vec<LatestSelection>> {
        if self.kind != BarrierKind::LatestValue {
            return Err(TpError::invalid("not a latest-value barrier"));
        }
        let mut selections: Vec<LatestSelection> = self
            .inputs
            .iter()
            .filter(|s| s.has_observed_seq || s.has_observed_time)
            .map(|s| LatestSelection {
                stream_id: s.stream_id,
                seq: s.observed_seq,
                timestamp_ns: s.observed_time_ns,
                timestamp_source: s.timestamp_source,
            })
            .collect();
        match self.latest_ordering {
            LatestOrdering::Sequence => selections.sort_by(|a, b| b.seq.cmp(&a.seq)),
            LatestOrdering::Timestamp => {
                selections.sort_by(|a, b| b.timestamp_ns.cmp(&a.timestamp_ns));
            }
        }
        Ok(selections)
    }
}
