//! Active run registry and the per-run delta stream
//!
//! The gateway streams cumulative text snapshots; consumers want ordered
//! increments. Each run gets an unbounded channel: a blocked `recv` is the
//! run's single waiter, channel backlog is its FIFO delta queue, and a
//! terminal variant ends the stream exactly once.
//!
//! A run's id is only known from the `chat.send` ack, and the gateway may
//! push the first `agent` event right behind that ack. The channel is
//! therefore claimed under the request id before the request goes out, and
//! the read loop binds it to the run id while processing the ack, before it
//! touches the next frame. Events can never outrun registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{chat_states, extract_text_content, AgentEventPayload, ChatEventPayload};

/// Signal delivered to a run's consumer
#[derive(Debug)]
enum RunSignal {
    /// Newly appended text
    Delta(String),
    /// Run finished normally
    Done,
    /// Run failed or was aborted
    Failed(Error),
}

/// Registry-side state for one active run
#[derive(Debug)]
struct ActiveRun {
    tx: mpsc::UnboundedSender<RunSignal>,
    /// Length in bytes of the cumulative text already emitted as deltas
    emitted_len: usize,
}

#[derive(Debug, Default)]
struct Inner {
    /// Active runs keyed by server-issued run id
    runs: HashMap<String, ActiveRun>,
    /// Channels claimed for in-flight `chat.send` requests, keyed by
    /// request id until the ack names the run
    claims: HashMap<String, mpsc::UnboundedSender<RunSignal>>,
}

/// Table of active runs and claimed-but-unacked channels
#[derive(Debug, Clone, Default)]
pub(crate) struct RunRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RunRegistry {
    pub(crate) fn new() -> Self {
        RunRegistry::default()
    }

    /// Claim a channel for an outgoing `chat.send` request
    pub(crate) fn claim(&self, request_id: &str) -> ClaimedRun {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().claims.insert(request_id.to_string(), tx);
        ClaimedRun {
            request_id: request_id.to_string(),
            rx: Some(rx),
            registry: self.clone(),
        }
    }

    /// Promote a claim to an active run once its ack names the run id.
    ///
    /// Must run in the frame-dispatch task before the ack resolves, so no
    /// later event can observe the run as unknown.
    pub(crate) fn bind_claim(&self, request_id: &str, run_id: String) {
        let mut inner = self.lock();
        let Some(tx) = inner.claims.remove(request_id) else {
            return;
        };
        inner.runs.insert(run_id, ActiveRun { tx, emitted_len: 0 });
    }

    fn discard_claim(&self, request_id: &str) {
        self.lock().claims.remove(request_id);
    }

    /// Apply an `agent` streaming event: diff the snapshot against what the
    /// run has already seen and deliver only the new suffix
    pub(crate) fn on_agent_event(&self, payload: AgentEventPayload) {
        let Some(run_id) = payload.run_id else { return };
        if payload.stream.as_deref() != Some("assistant") {
            return;
        }
        let Some(data) = payload.data else { return };

        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(&run_id) else {
            debug!("Agent event for unknown run {}", run_id);
            return;
        };
        let full_text = extract_text_content(&data);
        let delta = full_text.get(run.emitted_len..).unwrap_or("").to_string();
        run.emitted_len = full_text.len();
        if delta.is_empty() {
            return;
        }
        if run.tx.send(RunSignal::Delta(delta)).is_err() {
            // Receiver gone means the consumer detached; forget the run
            inner.runs.remove(&run_id);
        }
    }

    /// Apply a `chat` lifecycle event: route the terminal signal and retire
    /// the run
    pub(crate) fn on_chat_event(&self, payload: ChatEventPayload) {
        let Some(run_id) = payload.run_id else { return };
        let Some(state) = payload.state else { return };
        match state.as_str() {
            chat_states::FINAL => {
                if let Some(run) = self.lock().runs.remove(&run_id) {
                    let _ = run.tx.send(RunSignal::Done);
                }
            }
            chat_states::ERROR | chat_states::ABORTED => {
                if let Some(run) = self.lock().runs.remove(&run_id) {
                    let message = payload
                        .error_message
                        .unwrap_or_else(|| format!("Chat {}", state));
                    let err = if state == chat_states::ABORTED {
                        Error::RunAborted(message)
                    } else {
                        Error::RunFailed(message)
                    };
                    let _ = run.tx.send(RunSignal::Failed(err));
                }
            }
            other => debug!("Ignoring chat event state {} for run {}", other, run_id),
        }
    }

    /// Fail every active run with a connection-lost error. Unbound claims
    /// are dropped silently; their acks fail through the correlator.
    pub(crate) fn fail_all(&self) {
        let (runs, claims) = {
            let mut inner = self.lock();
            (
                inner.runs.drain().collect::<Vec<_>>(),
                inner.claims.drain().collect::<Vec<_>>(),
            )
        };
        for (run_id, run) in runs {
            debug!("Failing run {} after connection loss", run_id);
            let _ = run.tx.send(RunSignal::Failed(Error::ConnectionLost));
        }
        drop(claims);
    }

    fn remove(&self, run_id: &str) {
        self.lock().runs.remove(run_id);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    #[cfg(test)]
    fn claim_count(&self) -> usize {
        self.lock().claims.len()
    }
}

/// Channel claimed for a `chat.send` whose ack has not arrived yet.
///
/// Dropping it before [`ClaimedRun::into_stream`] withdraws the claim, so a
/// failed send leaves nothing behind.
#[derive(Debug)]
pub(crate) struct ClaimedRun {
    request_id: String,
    rx: Option<mpsc::UnboundedReceiver<RunSignal>>,
    registry: RunRegistry,
}

impl ClaimedRun {
    /// Turn the claim into the consumer stream for the acked run
    pub(crate) fn into_stream(mut self, run_id: String) -> RunStream {
        // A claim is consumed at most once; the fallback channel is already
        // closed and only exists to keep this path panic-free
        let rx = self
            .rx
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        RunStream {
            run_id,
            rx,
            registry: self.registry.clone(),
            finished: false,
        }
    }
}

impl Drop for ClaimedRun {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.registry.discard_claim(&self.request_id);
        }
    }
}

/// Ordered, single-consumer stream of one run's text deltas.
///
/// The stream is finite: it ends with `Ok(None)` when the run completes, or
/// with the run's failure. Dropping it detaches the consumer; the run keeps
/// going on the gateway and its remaining events are discarded.
#[derive(Debug)]
pub struct RunStream {
    run_id: String,
    rx: mpsc::UnboundedReceiver<RunSignal>,
    registry: RunRegistry,
    finished: bool,
}

impl RunStream {
    /// Server-issued id of the run feeding this stream
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next delta; `Ok(None)` at normal end of stream.
    ///
    /// Buffered deltas drain before this suspends, and taking `&mut self`
    /// makes a second simultaneous waiter unrepresentable.
    pub async fn next_delta(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(RunSignal::Delta(text)) => Ok(Some(text)),
            Some(RunSignal::Done) => {
                self.finished = true;
                Ok(None)
            }
            Some(RunSignal::Failed(err)) => {
                self.finished = true;
                Err(err)
            }
            // Sender gone without a terminal signal
            None => {
                self.finished = true;
                Err(Error::ConnectionLost)
            }
        }
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        self.registry.remove(&self.run_id);
    }
}
