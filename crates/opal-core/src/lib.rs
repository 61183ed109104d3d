// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod actor;
mod agent;
mod bus;
mod compact;
mod events;
mod path_store;
mod prompts;
mod retry;
mod runtime_context;
mod session;
mod status_tag;
mod supervision;
mod task_tool;

pub use actor::{
    spawn_session_actor, ActorStatus, AgentHandle, AgentStateSnapshot, SessionCommand,
};
pub use agent::{Agent, SteerHandle};
pub use bus::{relay_to_bus, BusMessage, EventBus};
pub use compact::{
    compact_session, compact_session_with_strategy, detect_split_turn, emergency_compact,
    extract_file_ops, find_cut_point, parse_file_op_blocks, render_file_op_blocks, smart_truncate,
    FileOps,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use path_store::{NodeId, PathNode, PathStore};
pub use prompts::system_prompt;
pub use retry::{classify_error, retry_delay_ms, ErrorClass};
pub use runtime_context::AgentRuntimeContext;
pub use session::{Session, TurnRecord};
pub use status_tag::extract_status_tags;
pub use supervision::{ChildKind, SessionSupervisor, SupervisionEvent};
pub use task_tool::TaskTool;
