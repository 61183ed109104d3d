// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use opal_config::AgentMode;
use opal_model::Usage;
use opal_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The agent process has started handling a session.
    AgentStart,
    /// The agent process has finished handling a session and will not
    /// produce further events.
    AgentEnd { usage: Usage },
    /// The agent process restarted after a crash and resumed from the
    /// session's persisted history.
    AgentRecovered,
    /// Project context (AGENTS.md, git/CI metadata, skills) was gathered.
    /// Fired once per session, the first time this context is assembled.
    ContextDiscovered { files: Vec<String> },
    /// A skill's metadata was loaded into the system prompt.
    SkillLoaded { name: String, description: String },
    /// Compaction is about to run. Paired with `ContextCompacted`, which
    /// reports the outcome once the summarization call completes.
    CompactionStart { old_len: usize },
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        /// Which compaction path actually produced this result.
        strategy: CompactionStrategyUsed,
        /// The tool-round counter at which compaction fired (0 = pre-submit).
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Cumulative cache-read tokens for the session.
        cache_read_total: u64,
        /// Cumulative cache-write tokens for the session.
        cache_write_total: u64,
        /// The model's context window, for UI fraction display.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// An inline `<status>...</status>` tag extracted from a text delta.
    /// Never includes the surrounding tag markup.
    StatusUpdate(String),
    /// The current turn was cancelled; any text already streamed is
    /// committed as a partial assistant message before this is sent.
    Aborted { partial_text: String },
}

/// Which compaction path actually ran, surfaced to observers via
/// [`AgentEvent::ContextCompacted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// LLM-produced structured Markdown checkpoint.
    Structured,
    /// LLM-produced free-form narrative summary.
    Narrative,
    /// Deterministic drop-oldest fallback; no model call was made.
    Emergency,
}
