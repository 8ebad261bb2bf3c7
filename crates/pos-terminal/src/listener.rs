//! Outward listener interfaces and the registry that fans events out to them
//!
//! Listeners receive one tagged event type through a single `on_event` method, so an
//! implementer matches on the variants it cares about and ignores the rest. Closures of
//! the right shape are listeners too.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::events::DisplayCode;
use crate::reader::DecodedFields;
use crate::result::PaymentResult;

/// Reader link notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    NoDeviceDetected,
}

/// Transaction progress notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Reader waits for the card to be presented
    WaitingUser,
    /// Reader asked for the terminal time
    RequestTime,
    CardInserted,
    /// Several EMV applications qualify; the caller must select one or cancel
    SelectEmvApp(Vec<String>),
    OnlineProcess {
        tlv: String,
    },
    Display {
        code: DisplayCode,
        message: String,
    },
    /// PIN entry requested; `tries` is the remaining try count
    PinRequested {
        offline: bool,
        tries: u32,
    },
    /// PIN must be typed on the terminal and sent as an ISO-4 block
    PinKeypadRequested,
    /// Number of PIN digits entered so far (-1 clears)
    PinInputProgress(i32),
    PinMapResult {
        keys: Vec<String>,
        offline_time: i32,
    },
    CardInfoResult(DecodedFields),
    TransactionCompleted(PaymentResult),
    TransactionResult(PaymentResult),
    /// `message` is user-facing; `raw` is diagnostic data for logs only
    TransactionFailed {
        message: String,
        raw: Option<String>,
    },
}

impl TransactionEvent {
    pub fn failed(message: impl Into<String>, raw: Option<String>) -> Self {
        TransactionEvent::TransactionFailed {
            message: message.into(),
            raw,
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TransactionEvent::WaitingUser => "waiting_user",
            TransactionEvent::RequestTime => "request_time",
            TransactionEvent::CardInserted => "card_inserted",
            TransactionEvent::SelectEmvApp(_) => "select_emv_app",
            TransactionEvent::OnlineProcess { .. } => "online_process",
            TransactionEvent::Display { .. } => "display",
            TransactionEvent::PinRequested { .. } => "pin_requested",
            TransactionEvent::PinKeypadRequested => "pin_keypad_requested",
            TransactionEvent::PinInputProgress(_) => "pin_input_progress",
            TransactionEvent::PinMapResult { .. } => "pin_map_result",
            TransactionEvent::CardInfoResult(_) => "card_info_result",
            TransactionEvent::TransactionCompleted(_) => "transaction_completed",
            TransactionEvent::TransactionResult(_) => "transaction_result",
            TransactionEvent::TransactionFailed { .. } => "transaction_failed",
        }
    }
}

pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

pub trait TransactionListener: Send + Sync {
    fn on_event(&self, event: &TransactionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}

impl<F> TransactionListener for F
where
    F: Fn(&TransactionEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransactionEvent) {
        self(event)
    }
}

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct Entry<L: ?Sized> {
    id: ListenerId,
    listener: Arc<L>,
}

impl<L: ?Sized> Clone for Entry<L> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Copy-on-write listener list
///
/// Registration and removal swap in a new list; delivery iterates a snapshot, so
/// listeners may (un)register from any thread, including from inside a callback.
pub struct ListenerRegistry<L: ?Sized> {
    entries: RwLock<Arc<Vec<Entry<L>>>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; registering the same `Arc` twice returns the existing id
    pub fn register(&self, listener: Arc<L>) -> ListenerId {
        let mut entries = self.entries.write();
        if let Some(existing) = entries
            .iter()
            .find(|e| Arc::as_ptr(&e.listener) as *const () == Arc::as_ptr(&listener) as *const ())
        {
            return existing.id;
        }

        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(Entry { id, listener });
        *entries = Arc::new(next);
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<_> = entries.iter().filter(|e| e.id != id).cloned().collect();
        *entries = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `deliver` for each listener in registration order
    ///
    /// A panicking listener is logged and skipped; the others still receive the event.
    pub fn for_each(&self, event_name: &str, deliver: impl Fn(&L)) {
        let snapshot = Arc::clone(&self.entries.read());
        for entry in snapshot.iter() {
            trace!(listener = entry.id.0, event = event_name, "Delivering event");
            deliver_isolated(event_name, || deliver(entry.listener.as_ref()));
        }
    }
}

/// Run one listener callback, logging a panic instead of propagating it
pub(crate) fn deliver_isolated(event_name: &str, deliver: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(deliver)).is_err() {
        error!(event = event_name, "Listener panicked");
    }
}

impl ListenerRegistry<dyn ConnectionListener> {
    pub fn notify(&self, event: &ConnectionEvent) {
        self.for_each("connection", |l| l.on_event(event));
    }
}

impl ListenerRegistry<dyn TransactionListener> {
    pub fn notify(&self, event: &TransactionEvent) {
        self.for_each(event.name(), |l| l.on_event(event));
    }
}
