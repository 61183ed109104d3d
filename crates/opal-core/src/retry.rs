// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use opal_config::AgentConfig;

/// Classification of a provider error, used to decide whether the agent loop
/// retries, surfaces the failure, or routes it through compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limits, 5xx, connection resets — retry with backoff.
    Transient,
    /// Auth, invalid request, content policy — surface immediately.
    Permanent,
    /// Context window exceeded — trigger reactive compaction and retry.
    Overflow,
}

/// Classify a provider error message against the configured lexicons.
///
/// Matching is case-insensitive substring search. Overflow patterns are
/// checked first, then permanent, then transient, so an error string
/// matching both an overflow and a transient pattern (e.g. a "500:
/// context_length_exceeded" body) is classified as overflow — overflow and
/// permanent both take precedence over transient.
///
/// An error that matches none of the configured lexicons defaults to
/// `Transient`: an unrecognized provider error is more likely a flaky
/// condition worth one retry than something a human must intervene on.
pub fn classify_error(message: &str, config: &AgentConfig) -> ErrorClass {
    let lower = message.to_lowercase();
    if matches_any(&lower, &config.overflow_error_patterns) {
        return ErrorClass::Overflow;
    }
    if matches_any(&lower, &config.permanent_error_patterns) {
        return ErrorClass::Permanent;
    }
    ErrorClass::Transient
}

fn matches_any(haystack_lower: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| haystack_lower.contains(&p.to_lowercase()))
}

/// Exponential backoff delay for retry attempt `n` (1-indexed).
///
/// `delay(n) = min(retry_base_ms * 2^(n-1), retry_max_ms)`.
pub fn retry_delay_ms(attempt: u32, config: &AgentConfig) -> u64 {
    let exponent = attempt.saturating_sub(1).min(20);
    let scaled = config.retry_base_ms.saturating_mul(1u64 << exponent);
    scaled.min(config.retry_max_ms)
}
