// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use opal_model::{Message, Usage};
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// Clamp bounds for the running token-estimate calibration factor. A single
/// bad sample (e.g. a usage report that arrives after an unrelated session
/// mutation) should not be allowed to swing every subsequent estimate.
const CALIBRATION_MIN: f32 = 0.5;
const CALIBRATION_MAX: f32 = 3.0;

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list, using the
    /// `chars/4` heuristic.
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// The model's maximum output tokens, reserved out of `max_tokens` when
    /// computing the usable input budget.
    pub max_output_tokens: usize,
    /// Estimated token cost of the tool schemas and dynamic context block
    /// sent with every request but not stored in `messages`.
    pub schema_overhead: usize,
    /// Running correction multiplier applied to the `chars/4` estimate,
    /// updated from each provider `usage` report. Starts at 1.0.
    pub calibration_factor: f32,
    /// Cumulative prompt-cache-read tokens reported by the provider.
    pub cache_read_total: u64,
    /// Cumulative prompt-cache-write tokens reported by the provider.
    pub cache_write_total: u64,
    /// Cumulative input tokens reported by the provider across the session.
    pub input_tokens_total: u64,
    /// Cumulative output tokens reported by the provider across the session.
    pub output_tokens_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            input_tokens_total: 0,
            output_tokens_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Usable input budget: the context window minus the reserve for the
    /// model's own output tokens.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Calibrated token estimate: the raw `chars/4` sum plus schema overhead,
    /// scaled by the running calibration factor. See [`Self::update_calibration`].
    pub fn calibrated_tokens(&self) -> usize {
        ((self.token_count + self.schema_overhead) as f32 * self.calibration_factor) as usize
    }

    /// Fraction of the usable input budget consumed (0.0–1.0), using the
    /// calibrated estimate rather than the raw heuristic.
    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 { return 0.0; }
        (self.calibrated_tokens() as f32) / (budget as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Accumulate provider-reported prompt-cache usage for this turn.
    pub fn add_cache_usage(&mut self, read_tokens: u32, write_tokens: u32) {
        self.cache_read_total += read_tokens as u64;
        self.cache_write_total += write_tokens as u64;
    }

    /// Accumulate a provider `usage` report (input/output plus cache) into the
    /// session's running totals.
    pub fn record_usage(&mut self, input_tokens: u32, output_tokens: u32, cache_read: u32, cache_write: u32) {
        self.add_cache_usage(cache_read, cache_write);
        self.input_tokens_total += input_tokens as u64;
        self.output_tokens_total += output_tokens as u64;
    }

    /// Cumulative token usage for the whole session, for `AgentEvent::AgentEnd`.
    pub fn usage_snapshot(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens_total.min(u32::MAX as u64) as u32,
            output_tokens: self.output_tokens_total.min(u32::MAX as u64) as u32,
            cache_read_tokens: self.cache_read_total.min(u32::MAX as u64) as u32,
            cache_write_tokens: self.cache_write_total.min(u32::MAX as u64) as u32,
        }
    }

    /// Update the running calibration factor from an actual provider input
    /// token count versus what the `chars/4` heuristic estimated for the same
    /// request. Clamped to `[CALIBRATION_MIN, CALIBRATION_MAX]` so a single
    /// anomalous sample cannot swing future estimates wildly.
    pub fn update_calibration(&mut self, actual_input_tokens: u32, estimated_tokens: usize) {
        if estimated_tokens == 0 {
            return;
        }
        let ratio = actual_input_tokens as f32 / estimated_tokens as f32;
        self.calibration_factor = ratio.clamp(CALIBRATION_MIN, CALIBRATION_MAX);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
