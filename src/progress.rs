//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// Snapshot of the search sent after every grid row and at phase changes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BiftStatus {
    /// `log(alpha)` of the last evaluated point.
    pub alpha: f64,
    /// Log evidence of that point.
    pub evidence: f64,
    /// Chi-squared of that point.
    pub chi_squared: f64,
    /// Dmax of that point.
    pub dmax: f64,
    /// Grid points evaluated so far.
    pub points_done: usize,
    /// Size of the whole grid.
    pub points_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Message emitted to a [`ProgressSink`].
///
/// Serializes as `{"update": {...}}`, `{"canceled": true}` or `{"failed": true}`.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressMessage {
    Update(BiftStatus),
    Canceled,
    Failed,
}

impl Serialize for ProgressMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::Update(status) => map.serialize_entry("update", status)?,
            Self::Canceled => map.serialize_entry("canceled", &true)?,
            Self::Failed => map.serialize_entry("failed", &true)?,
        }
        map.end()
    }
}

/// Receiver of progress messages. Implemented for closures and channel senders.
pub trait ProgressSink {
    fn send(&self, message: ProgressMessage);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressMessage),
{
    fn send(&self, message: ProgressMessage) {
        self(message)
    }
}

impl ProgressSink for Sender<ProgressMessage> {
    fn send(&self, message: ProgressMessage) {
        // A dropped receiver only means nobody is listening any more.
        let _ = Sender::send(self, message);
    }
}

/// Sends to an optional sink.
pub(crate) fn emit(sink: Option<&dyn ProgressSink>, message: ProgressMessage) {
    if let Some(sink) = sink {
        sink.send(message);
    }
}

/// Shared flag polled at coarse checkpoints; cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// `true` when a token is present and set; an absent token never cancels.
pub(crate) fn is_canceled(token: Option<&CancelToken>) -> bool {
    token.is_some_and(CancelToken::is_canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!is_canceled(Some(&token)));
        assert!(!is_canceled(None));
        clone.cancel();
        assert!(token.is_canceled());
        assert!(is_canceled(Some(&token)));
    }

    #[test]
    fn channel_and_closure_sinks_receive_messages() {
        let (tx, rx) = channel();
        emit(Some(&tx), ProgressMessage::Failed);
        assert_eq!(rx.recv().unwrap(), ProgressMessage::Failed);

        let seen = std::cell::RefCell::new(Vec::new());
        let sink = |message: ProgressMessage| seen.borrow_mut().push(message);
        emit(Some(&sink), ProgressMessage::Canceled);
        assert_eq!(seen.borrow().as_slice(), &[ProgressMessage::Canceled]);
    }

    #[test]
    fn messages_serialize_to_wire_schema() {
        let canceled = serde_json::to_value(ProgressMessage::Canceled).unwrap();
        assert_eq!(canceled, serde_json::json!({ "canceled": true }));

        let update = ProgressMessage::Update(BiftStatus {
            alpha: 5.0,
            evidence: -12.5,
            chi_squared: 1.1,
            dmax: 80.0,
            points_done: 16,
            points_total: 160,
            status: None,
        });
        let value = serde_json::to_value(update).unwrap();
        assert_eq!(value["update"]["points_total"], 160);
        assert!(value["update"].get("status").is_none());
    }
}
