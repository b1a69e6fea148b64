//! Request correlation for the gateway session
//!
//! Matches inbound `res` frames to outstanding `req` frames by id. The
//! reserved connect handshake id never enters this table; the session's
//! state machine handles it directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::ResponseFrame;

type PendingMap = HashMap<String, oneshot::Sender<Result<Value>>>;

/// Pending-request table keyed by request id
#[derive(Debug)]
pub(crate) struct Correlator {
    /// Request id counter
    next_id: AtomicU64,
    /// Outstanding requests awaiting their response
    pending: Mutex<PendingMap>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Correlator {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh request id
    pub(crate) fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Register a pending entry and hand back its completion receiver
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    /// Drop a pending entry without resolving it (the send never went out)
    pub(crate) fn deregister(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Resolve or reject the entry matching a response frame
    pub(crate) fn complete(&self, frame: &ResponseFrame) {
        let Some(tx) = self.lock().remove(&frame.id) else {
            debug!("Response for unknown request id {}", frame.id);
            return;
        };
        let outcome = if frame.ok {
            Ok(frame
                .payload
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())))
        } else {
            Err(Error::RequestFailed(frame.error_message()))
        };
        let _ = tx.send(outcome);
    }

    /// Reject every outstanding request with a connection-lost error
    pub(crate) fn fail_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, tx) in drained {
            debug!("Failing pending request {} after connection loss", id);
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, ok: bool, payload: Option<Value>, message: Option<&str>) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            ok,
            payload,
            error: message.map(|m| crate::protocol::ProtocolError {
                code: None,
                message: Some(m.to_string()),
            }),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let correlator = Correlator::new();
        assert_eq!(correlator.next_id(), "1");
        assert_eq!(correlator.next_id(), "2");
        assert_eq!(correlator.next_id(), "3");
    }

    #[tokio::test]
    async fn test_complete_resolves_payload() {
        let correlator = Correlator::new();
        let rx = correlator.register("1");
        correlator.complete(&response("1", true, Some(json!({"runId": "r1"})), None));
        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload["runId"], "r1");
    }

    #[tokio::test]
    async fn test_complete_defaults_missing_payload_to_empty_object() {
        let correlator = Correlator::new();
        let rx = correlator.register("1");
        correlator.complete(&response("1", true, None, None));
        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload, json!({}));
    }

    #[tokio::test]
    async fn test_complete_rejects_with_upstream_message() {
        let correlator = Correlator::new();
        let rx = correlator.register("1");
        correlator.complete(&response("1", false, None, Some("session busy")));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "session busy");
    }

    #[tokio::test]
    async fn test_complete_rejects_with_default_message() {
        let correlator = Correlator::new();
        let rx = correlator.register("1");
        correlator.complete(&response("1", false, None, None));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Request failed");
    }

    #[test]
    fn test_unknown_response_is_ignored() {
        let correlator = Correlator::new();
        correlator.complete(&response("99", true, None, None));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let correlator = Correlator::new();
        let rx1 = correlator.register("1");
        let rx2 = correlator.register("2");
        correlator.fail_all();
        assert!(matches!(
            rx1.await.unwrap(),
            Err(Error::ConnectionLost)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_deregister_drops_the_sender() {
        let correlator = Correlator::new();
        let rx = correlator.register("1");
        correlator.deregister("1");
        assert!(rx.await.is_err());
    }
}
