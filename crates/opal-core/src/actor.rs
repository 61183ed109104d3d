// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Task-per-session actor wrapping [`Agent`].
//!
//! `Agent` itself stays a plain struct driven by `&mut self` methods — that
//! keeps its own code straightforward to read and test. This module is the
//! seam where concurrent callers (a TUI input loop, a gateway handling
//! several inbound requests) get task-per-session semantics: one spawned
//! task owns the `Agent` exclusively and processes `SessionCommand`s from a
//! mailbox one at a time, so `prompt`/`steer`/`stop`/`set_model`/`get_state`
//! calls from different callers never race on the same `&mut Agent`.
//!
//! A `Stop` or `Steer` sent while a `Prompt` is being driven does not queue
//! behind it: [`drive_prompt`] races the in-flight turn against continued
//! mailbox receipt via `tokio::select!`, so both reach the turn while it is
//! still running.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::agent::{Agent, SteerHandle};
use crate::events::AgentEvent;

/// One message a session actor's mailbox accepts.
pub enum SessionCommand {
    /// Start a new turn. `done` resolves once the turn finishes, is
    /// stopped, or is rejected because another turn is already running;
    /// events stream out through `tx` as usual.
    Prompt {
        text: String,
        tx: mpsc::Sender<AgentEvent>,
        done: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Inject steering text into the turn currently in flight. A no-op if no
    /// turn is running.
    Steer(String),
    /// Cancel the turn currently in flight. A no-op if none is running.
    Stop,
    /// Swap the model used by subsequent turns. Applied immediately if no
    /// turn is in flight, or once the in-flight turn finishes otherwise.
    SetModel(Arc<dyn opal_model::ModelProvider>),
    /// Query the actor's current status and token usage.
    GetState(oneshot::Sender<AgentStateSnapshot>),
}

/// Whether a session actor is between turns or driving one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Idle,
    Running,
}

/// Snapshot returned by [`AgentHandle::get_state`]. While `Running`, `usage`
/// and `message_count` reflect the turn's start rather than live mid-turn
/// values: the in-flight `submit_with_cancel` future holds the `Agent`
/// mutably for its whole duration, so the mailbox loop cannot read through it
/// until the turn ends.
#[derive(Debug, Clone)]
pub struct AgentStateSnapshot {
    pub status: ActorStatus,
    pub usage: opal_model::Usage,
    pub message_count: usize,
}

/// Cloneable handle to a running session actor's mailbox.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl AgentHandle {
    /// Run one turn and wait for it to finish. Concurrent `steer`/`stop`
    /// calls from other clones of this handle reach the turn while it runs.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Prompt {
                text: text.into(),
                tx: events,
                done: done_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("session actor is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("session actor dropped the turn without replying"))?
    }

    /// Queue steering text for the turn currently (or next) in flight.
    pub async fn steer(&self, text: impl Into<String>) {
        let _ = self.tx.send(SessionCommand::Steer(text.into())).await;
    }

    /// Cancel the turn currently in flight, if any.
    pub async fn stop(&self) {
        let _ = self.tx.send(SessionCommand::Stop).await;
    }

    /// Swap the model used by subsequent turns.
    pub async fn set_model(&self, model: Arc<dyn opal_model::ModelProvider>) {
        let _ = self.tx.send(SessionCommand::SetModel(model)).await;
    }

    /// Query the actor's current status and token usage.
    pub async fn get_state(&self) -> anyhow::Result<AgentStateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::GetState(tx))
            .await
            .map_err(|_| anyhow::anyhow!("session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("session actor dropped the state query"))
    }
}

/// Spawn `agent` as a task-per-session actor. The returned task is the only
/// thing that ever calls `agent`'s `&mut self` methods; register its
/// `JoinHandle` with a [`crate::SessionSupervisor`] as
/// `ChildKind::AgentProcess` to fold it into that session's supervision tree.
pub fn spawn_session_actor(mut agent: Agent) -> (AgentHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move { run_session_actor(&mut agent, rx).await });
    (AgentHandle { tx }, handle)
}

async fn run_session_actor(agent: &mut Agent, mut rx: mpsc::Receiver<SessionCommand>) {
    let steer = agent.steer_handle();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SessionCommand::Prompt { text, tx, done } => {
                let result = drive_prompt(agent, &steer, &text, tx, &mut rx).await;
                let _ = done.send(result);
            }
            SessionCommand::Steer(text) => steer.steer(text),
            SessionCommand::Stop => {}
            SessionCommand::SetModel(model) => agent.set_model(model),
            SessionCommand::GetState(reply) => {
                let _ = reply.send(AgentStateSnapshot {
                    status: ActorStatus::Idle,
                    usage: agent.session().usage_snapshot(),
                    message_count: agent.session().messages.len(),
                });
            }
        }
    }
}

/// Drive a single turn to completion, racing it against continued mailbox
/// receipt so `Steer`/`Stop` reach the turn instead of queueing behind it.
/// A `SetModel` received mid-turn is deferred until the turn ends, since
/// `Agent::submit_with_cancel` holds `agent` mutably for its whole duration.
/// A second `Prompt` received mid-turn is rejected rather than silently
/// dropped or queued, since only one turn can run per `Agent` at a time.
async fn drive_prompt(
    agent: &mut Agent,
    steer: &SteerHandle,
    text: &str,
    tx: mpsc::Sender<AgentEvent>,
    rx: &mut mpsc::Receiver<SessionCommand>,
) -> anyhow::Result<()> {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut cancel_tx = Some(cancel_tx);
    let mut pending_model: Option<Arc<dyn opal_model::ModelProvider>> = None;
    // Taken before `submit` borrows `agent` mutably; see `AgentStateSnapshot`'s
    // doc comment for why a `GetState` mid-turn can't read live values.
    let usage_at_turn_start = agent.session().usage_snapshot();
    let message_count_at_turn_start = agent.session().messages.len();

    let result = {
        let submit = agent.submit_with_cancel(text, tx, cancel_rx);
        tokio::pin!(submit);

        let mut mailbox_open = true;
        loop {
            tokio::select! {
                biased;
                result = &mut submit => break result,
                cmd = rx.recv(), if mailbox_open => {
                    match cmd {
                        Some(SessionCommand::Steer(s)) => steer.steer(s),
                        Some(SessionCommand::Stop) => {
                            if let Some(c) = cancel_tx.take() {
                                let _ = c.send(());
                            }
                        }
                        Some(SessionCommand::SetModel(model)) => pending_model = Some(model),
                        Some(SessionCommand::Prompt { done, .. }) => {
                            let _ = done.send(Err(anyhow::anyhow!(
                                "a turn is already in progress for this session"
                            )));
                        }
                        Some(SessionCommand::GetState(reply)) => {
                            let _ = reply.send(AgentStateSnapshot {
                                status: ActorStatus::Running,
                                usage: usage_at_turn_start.clone(),
                                message_count: message_count_at_turn_start,
                            });
                        }
                        None => mailbox_open = false,
                    }
                }
            }
        }
    };

    if let Some(model) = pending_model {
        agent.set_model(model);
    }
    result
}
