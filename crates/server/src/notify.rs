//! Notification events and sinks.
//!
//! The core emits a small set of operator-facing events; sinks decide how
//! to deliver them. The default sink writes structured log lines.

use std::sync::Mutex;
use time::OffsetDateTime;

/// Operator-facing events.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A store filled up (or failed) and was disabled.
    StoreDisabled { store: String },
    /// A peer has had transfers disabled for longer than the warn timer.
    PeerTransfersDisabled {
        librarian: String,
        since: OffsetDateTime,
    },
    /// An instance failed its checksum check.
    FileCorrupt {
        file: String,
        instance_id: i64,
        detector: String,
    },
    /// Rolling deletion has been blocked on a candidate for over a day.
    DeletionBlocked {
        file: String,
        store: String,
        verified_copies: u64,
        required: u64,
    },
}

/// A notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Default sink: structured log lines at warn level.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: Event) {
        match &event {
            Event::StoreDisabled { store } => {
                tracing::warn!(store = %store, "store disabled");
            }
            Event::PeerTransfersDisabled { librarian, since } => {
                tracing::warn!(librarian = %librarian, since = %since, "peer transfers disabled past warn timer");
            }
            Event::FileCorrupt {
                file,
                instance_id,
                detector,
            } => {
                tracing::warn!(file = %file, instance_id, detector = %detector, "file flagged corrupt");
            }
            Event::DeletionBlocked {
                file,
                store,
                verified_copies,
                required,
            } => {
                tracing::warn!(
                    file = %file,
                    store = %store,
                    verified_copies,
                    required,
                    "rolling deletion blocked by insufficient verified copies"
                );
            }
        }
    }
}

/// Sink that records events in memory. For tests.
#[derive(Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<Event>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
