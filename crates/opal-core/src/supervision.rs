// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session supervision tree.
//!
//! Each session owns an isolated subtree of tasks with a **rest-for-one**
//! restart discipline, supervised in this declaration order:
//!
//! 1. tool task supervisor
//! 2. sub-agent supervisor
//! 3. MCP client supervisor
//! 4. session store process (optional; only when persistence is enabled)
//! 5. agent process (the loop)
//!
//! If a child at position *k* terminates unexpectedly, every child declared
//! at or after position *k* is aborted too, since it (transitively) depends
//! on the crashed child. A crash at the agent process itself (position 5,
//! the last) aborts nothing else. Teardown of a whole session cascades
//! through all five in reverse declaration order.

use futures::future::select_all;
use tokio::task::{JoinError, JoinHandle};

/// Which class of child crashed or exited, in supervision declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    ToolSupervisor,
    SubAgentSupervisor,
    McpSupervisor,
    SessionStore,
    AgentProcess,
}

/// The outcome of one `watch_once` cycle: which child triggered the
/// rest-for-one cascade, and which other children were aborted as a result.
#[derive(Debug)]
pub struct SupervisionEvent {
    pub session_id: String,
    pub crashed: ChildKind,
    pub crash_result: Result<(), JoinError>,
    /// Children declared at or after `crashed`'s position, aborted as part
    /// of the same rest-for-one cascade.
    pub aborted: Vec<ChildKind>,
}

impl SupervisionEvent {
    /// True if the crashed child was cancelled by a previous cascade rather
    /// than failing on its own — callers restarting the agent only care
    /// about the former.
    pub fn was_cascaded(&self) -> bool {
        self.crash_result
            .as_ref()
            .err()
            .map(JoinError::is_cancelled)
            .unwrap_or(false)
    }
}

/// Supervises one session's child tasks and applies rest-for-one on crash.
///
/// This is the runtime primitive described in the spec's "supervisor
/// implementation shape": a watcher observes join handles in declaration
/// order and aborts everything at or after the position that crashed. The
/// session's host (the session-actor loop) is responsible for actually
/// restarting the agent process after `watch_once` reports a crash — restart
/// and crash-recovery are the same code path, driven from the session store
/// replay.
pub struct SessionSupervisor {
    session_id: String,
    kinds: Vec<ChildKind>,
    handles: Vec<JoinHandle<()>>,
}

impl SessionSupervisor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), kinds: Vec::new(), handles: Vec::new() }
    }

    /// Register a child task. Children must be registered in the
    /// declaration order above — callers that skip the optional session
    /// store process just never call this with `ChildKind::SessionStore`.
    pub fn supervise(&mut self, kind: ChildKind, handle: JoinHandle<()>) {
        self.kinds.push(kind);
        self.handles.push(handle);
    }

    /// No children are currently supervised (e.g. after a full teardown).
    pub fn is_idle(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for the first supervised child (in any position) to terminate,
    /// then apply rest-for-one: abort every child declared at or after that
    /// position and remove them from supervision. Children declared earlier
    /// remain supervised for the next `watch_once` call.
    ///
    /// Returns `None` if nothing is currently supervised.
    pub async fn watch_once(&mut self) -> Option<SupervisionEvent> {
        if self.handles.is_empty() {
            return None;
        }
        let handles = std::mem::take(&mut self.handles);
        let kinds = std::mem::take(&mut self.kinds);
        let (result, idx, remaining_handles) = select_all(handles).await;
        let crashed_kind = kinds[idx];

        let mut remaining_iter = remaining_handles.into_iter();
        let mut aborted = Vec::new();
        for (orig_idx, kind) in kinds.into_iter().enumerate() {
            if orig_idx == idx {
                continue;
            }
            let handle = remaining_iter
                .next()
                .expect("select_all returned fewer surviving handles than expected");
            if orig_idx < idx {
                self.kinds.push(kind);
                self.handles.push(handle);
            } else {
                handle.abort();
                aborted.push(kind);
            }
        }

        Some(SupervisionEvent {
            session_id: self.session_id.clone(),
            crashed: crashed_kind,
            crash_result: result,
            aborted,
        })
    }

    /// Abort every supervised child, in reverse declaration order, for a
    /// full session teardown.
    pub fn teardown(&mut self) {
        for handle in self.handles.drain(..).rev() {
            handle.abort();
        }
        self.kinds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_finishes() -> JoinHandle<()> {
        tokio::spawn(async {
            std::future::pending::<()>().await;
        })
    }

    fn finishes_immediately() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn watch_once_on_idle_supervisor_returns_none() {
        let mut sup = SessionSupervisor::new("s1");
        assert!(sup.watch_once().await.is_none());
    }

    #[tokio::test]
    async fn crash_in_middle_aborts_only_later_children() {
        let mut sup = SessionSupervisor::new("s1");
        sup.supervise(ChildKind::ToolSupervisor, never_finishes());
        sup.supervise(ChildKind::SubAgentSupervisor, never_finishes());
        sup.supervise(ChildKind::McpSupervisor, finishes_immediately());
        sup.supervise(ChildKind::SessionStore, never_finishes());
        sup.supervise(ChildKind::AgentProcess, never_finishes());

        let event = sup.watch_once().await.expect("expected a crash event");
        assert_eq!(event.crashed, ChildKind::McpSupervisor);
        assert_eq!(event.aborted, vec![ChildKind::SessionStore, ChildKind::AgentProcess]);

        // Earlier-declared children remain supervised.
        assert_eq!(sup.handles.len(), 2);
        assert_eq!(sup.kinds, vec![ChildKind::ToolSupervisor, ChildKind::SubAgentSupervisor]);
    }

    #[tokio::test]
    async fn crash_at_agent_process_aborts_nothing_else() {
        let mut sup = SessionSupervisor::new("s1");
        sup.supervise(ChildKind::ToolSupervisor, never_finishes());
        sup.supervise(ChildKind::AgentProcess, finishes_immediately());

        let event = sup.watch_once().await.unwrap();
        assert_eq!(event.crashed, ChildKind::AgentProcess);
        assert!(event.aborted.is_empty());
        assert_eq!(sup.handles.len(), 1);
    }

    #[tokio::test]
    async fn crash_at_first_position_aborts_everything_after() {
        let mut sup = SessionSupervisor::new("s1");
        sup.supervise(ChildKind::ToolSupervisor, finishes_immediately());
        sup.supervise(ChildKind::SubAgentSupervisor, never_finishes());
        sup.supervise(ChildKind::AgentProcess, never_finishes());

        let event = sup.watch_once().await.unwrap();
        assert_eq!(event.crashed, ChildKind::ToolSupervisor);
        assert_eq!(event.aborted, vec![ChildKind::SubAgentSupervisor, ChildKind::AgentProcess]);
        assert!(sup.is_idle());
    }

    #[tokio::test]
    async fn teardown_aborts_every_child() {
        let mut sup = SessionSupervisor::new("s1");
        sup.supervise(ChildKind::ToolSupervisor, never_finishes());
        sup.supervise(ChildKind::AgentProcess, never_finishes());
        sup.teardown();
        assert!(sup.is_idle());
    }

    #[tokio::test]
    async fn crash_result_is_not_cascaded_for_a_real_failure() {
        let mut sup = SessionSupervisor::new("s1");
        sup.supervise(ChildKind::ToolSupervisor, finishes_immediately());
        sup.supervise(ChildKind::AgentProcess, never_finishes());
        let event = sup.watch_once().await.unwrap();
        assert!(!event.was_cascaded());
    }

    #[tokio::test]
    async fn was_cascaded_true_once_an_aborted_handle_resolves() {
        let handle = never_finishes();
        handle.abort();
        let result = handle.await;
        let event = SupervisionEvent {
            session_id: "s1".into(),
            crashed: ChildKind::SessionStore,
            crash_result: result,
            aborted: Vec::new(),
        };
        assert!(event.was_cascaded());
    }
}
