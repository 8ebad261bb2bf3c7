//! Card reader abstraction
//!
//! A [`CardReader`] is the vendor SDK seen from the engine: every command is
//! fire-and-forget and its outcome arrives later as a [`ReaderEvent`] pushed through the
//! [`EventSender`] handed over in [`CardReader::attach`]. The only synchronous calls are
//! the data queries (`encrypt_data`, `nfc_batch_data`, `analyse_icc_data`).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::ReaderEvent;

/// Key/value fields decoded by the reader (`maskedPAN`, `formatID`, `pinKsn`, ...)
pub type DecodedFields = HashMap<String, String>;

/// The single active reader link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Bluetooth(String),
    Usb(String),
    Uart,
}

impl ConnectionState {
    /// Resolve the link type from a device address
    ///
    /// MAC-style addresses (containing `:`) are Bluetooth, any other non-empty address is
    /// a USB device handle, and an empty address selects the built-in UART.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        if address.is_empty() {
            ConnectionState::Uart
        } else if address.contains(':') {
            ConnectionState::Bluetooth(address.to_string())
        } else {
            ConnectionState::Usb(address.to_string())
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Bluetooth(address) => write!(f, "bluetooth({address})"),
            ConnectionState::Usb(handle) => write!(f, "usb({handle})"),
            ConnectionState::Uart => f.write_str("uart"),
        }
    }
}

/// Card-entry interfaces the reader opens for a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardTradeMode {
    SwipeTapInsertCard,
    SwipeTapInsertCardNotUp,
    SwipeInsertCard,
    TapInsertCard,
    OnlyInsertCard,
    OnlySwipeCard,
    OnlyTapCard,
}

impl CardTradeMode {
    /// Mode used when nothing is configured; smart terminals have no card-up prompt
    pub fn device_default(smart_device: bool) -> Self {
        if smart_device {
            CardTradeMode::SwipeTapInsertCardNotUp
        } else {
            CardTradeMode::SwipeTapInsertCard
        }
    }
}

/// Transaction types understood by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Goods,
    Services,
    Cash,
    Cashback,
    Refund,
    Inquiry,
    Transfer,
    Admin,
    CashDeposit,
    Payment,
    PbocLog,
    Sale,
    Preauth,
    EcqDesignatedLoad,
    EcqUndesignatedLoad,
    EcqCashLoad,
    EcqCashLoadVoid,
    UpdatePin,
    SalesNew,
    BalanceUpdate,
    Balance,
}

impl TransactionType {
    /// Resolve a persisted transaction type name; unknown names fall back to `GOODS`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "GOODS" => TransactionType::Goods,
            "SERVICES" => TransactionType::Services,
            "CASH" => TransactionType::Cash,
            "CASHBACK" => TransactionType::Cashback,
            "REFUND" | "PURCHASE_REFUND" => TransactionType::Refund,
            "INQUIRY" => TransactionType::Inquiry,
            "TRANSFER" => TransactionType::Transfer,
            "ADMIN" => TransactionType::Admin,
            "CASHDEPOSIT" | "CASH_DEPOSIT" => TransactionType::CashDeposit,
            "PAYMENT" => TransactionType::Payment,
            "PBOCLOG" | "ECQ_INQUIRE_LOG" => TransactionType::PbocLog,
            "SALE" => TransactionType::Sale,
            "PREAUTH" => TransactionType::Preauth,
            "ECQ_DESIGNATED_LOAD" => TransactionType::EcqDesignatedLoad,
            "ECQ_UNDESIGNATED_LOAD" => TransactionType::EcqUndesignatedLoad,
            "ECQ_CASH_LOAD" => TransactionType::EcqCashLoad,
            "ECQ_CASH_LOAD_VOID" => TransactionType::EcqCashLoadVoid,
            "CHANGE_PIN" | "UPDATE_PIN" => TransactionType::UpdatePin,
            "SALES_NEW" => TransactionType::SalesNew,
            "BALANCE_UPDATE" => TransactionType::BalanceUpdate,
            "BALANCE" => TransactionType::Balance,
            other => {
                warn!(name = other, "Unknown transaction type, using GOODS");
                TransactionType::Goods
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionType::Goods => "GOODS",
            TransactionType::Services => "SERVICES",
            TransactionType::Cash => "CASH",
            TransactionType::Cashback => "CASHBACK",
            TransactionType::Refund => "REFUND",
            TransactionType::Inquiry => "INQUIRY",
            TransactionType::Transfer => "TRANSFER",
            TransactionType::Admin => "ADMIN",
            TransactionType::CashDeposit => "CASHDEPOSIT",
            TransactionType::Payment => "PAYMENT",
            TransactionType::PbocLog => "PBOCLOG",
            TransactionType::Sale => "SALE",
            TransactionType::Preauth => "PREAUTH",
            TransactionType::EcqDesignatedLoad => "ECQ_DESIGNATED_LOAD",
            TransactionType::EcqUndesignatedLoad => "ECQ_UNDESIGNATED_LOAD",
            TransactionType::EcqCashLoad => "ECQ_CASH_LOAD",
            TransactionType::EcqCashLoadVoid => "ECQ_CASH_LOAD_VOID",
            TransactionType::UpdatePin => "UPDATE_PIN",
            TransactionType::SalesNew => "SALES_NEW",
            TransactionType::BalanceUpdate => "BALANCE_UPDATE",
            TransactionType::Balance => "BALANCE",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle through which a reader reports events to the engine
///
/// Wraps the bounded queue feeding the coordinator's event loop. Cloning is cheap; all
/// clones feed the same queue, so events keep the order in which they were emitted.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ReaderEvent>,
    /// Sends handed to tasks and not yet queued
    deferred: Arc<AtomicUsize>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<ReaderEvent>) -> Self {
        Self {
            tx,
            deferred: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue an event for delivery, waiting for capacity when the queue is full
    ///
    /// Events are never dropped while the engine is running:
    /// - From an SDK callback thread, the call blocks.
    /// - On a multi-thread runtime worker, it blocks in place.
    /// - On a current-thread runtime, whose event loop shares this thread, the send
    ///   is handed to a task. Later events queue behind deferred ones, so emission
    ///   order holds.
    ///
    /// Returns `false` only when the engine has stopped.
    pub fn emit(&self, event: ReaderEvent) -> bool {
        let event = if self.deferred.load(Ordering::Acquire) > 0 {
            event
        } else {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(event)) => event,
            }
        };

        match Handle::try_current() {
            Err(_) => self.tx.blocking_send(event).is_ok(),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                self.defer(&handle, event)
            }
            Ok(_) => {
                debug!("Event queue full, waiting for capacity");
                task::block_in_place(|| self.tx.blocking_send(event).is_ok())
            }
        }
    }

    fn defer(&self, handle: &Handle, event: ReaderEvent) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        debug!("Event queue full, deferring reader event");
        self.deferred.fetch_add(1, Ordering::AcqRel);
        let tx = self.tx.clone();
        let deferred = Arc::clone(&self.deferred);
        // Tasks are polled in spawn order and waiting senders are served in order
        handle.spawn(async move {
            if tx.send(event).await.is_err() {
                warn!("Event loop stopped, reader event dropped");
            }
            deferred.fetch_sub(1, Ordering::AcqRel);
        });
        true
    }
}

/// Commands and queries of a card reader
pub trait CardReader: Send + Sync {
    /// Hand the reader the queue its events must be pushed to
    fn attach(&self, events: EventSender);

    fn connect(&self, connection: &ConnectionState) -> Result<()>;
    fn disconnect(&self) -> Result<()>;

    /// Ask for the terminal id; answered with [`ReaderEvent::TerminalId`]
    fn request_terminal_id(&self) -> Result<()>;

    fn set_card_trade_mode(&self, mode: CardTradeMode) -> Result<()>;
    fn set_amount(
        &self,
        amount: &str,
        cashback_amount: &str,
        currency_code: &str,
        transaction_type: TransactionType,
    ) -> Result<()>;
    fn do_trade(&self, timeout_secs: u64) -> Result<()>;
    fn cancel_trade(&self) -> Result<()>;

    /// Begin EMV application processing after a chip card is detected
    fn start_emv(&self) -> Result<()>;
    fn select_emv_app(&self, index: usize) -> Result<()>;
    fn cancel_select_emv_app(&self) -> Result<()>;

    /// Terminal time as `yyyyMMddHHmmss`
    fn send_time(&self, terminal_time: &str) -> Result<()>;

    /// Plain PIN entry; an empty PIN bypasses PIN entry
    fn send_pin(&self, pin: &str) -> Result<()>;
    fn send_cvm_pin(&self, pin_block: &str, encrypted: bool) -> Result<()>;
    fn pin_map_sync(&self, value: &str, timeout_secs: u64) -> Result<()>;
    fn cancel_pin(&self) -> Result<()>;

    /// Feed the issuer response back to the card as TLV hex
    fn send_online_process_result(&self, tlv_hex: &str) -> Result<()>;

    /// Per-transaction PIN context: `RandomData`, `PAN`, `AESKey`, `isOnlinePin`, `pinTryLimit`
    fn encrypt_data(&self) -> Result<DecodedFields>;
    fn nfc_batch_data(&self) -> Result<DecodedFields>;
    fn analyse_icc_data(&self, tlv_hex: &str) -> Result<DecodedFields>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_from_address() {
        assert_eq!(
            ConnectionState::from_address("00:11:22:33:44:55"),
            ConnectionState::Bluetooth("00:11:22:33:44:55".to_string())
        );
        assert_eq!(
            ConnectionState::from_address("/dev/bus/usb/001/004"),
            ConnectionState::Usb("/dev/bus/usb/001/004".to_string())
        );
        assert_eq!(ConnectionState::from_address(""), ConnectionState::Uart);
        assert_eq!(ConnectionState::from_address("  "), ConnectionState::Uart);
    }

    #[test]
    fn test_transaction_type_names() {
        assert_eq!(TransactionType::from_name("GOODS"), TransactionType::Goods);
        assert_eq!(TransactionType::from_name("purchase_refund"), TransactionType::Refund);
        assert_eq!(TransactionType::from_name("CHANGE_PIN"), TransactionType::UpdatePin);
        assert_eq!(TransactionType::from_name("bogus"), TransactionType::Goods);
        assert_eq!(TransactionType::Refund.to_string(), "REFUND");
    }

    #[test]
    fn test_card_trade_mode_default() {
        assert_eq!(
            CardTradeMode::device_default(true),
            CardTradeMode::SwipeTapInsertCardNotUp
        );
        assert_eq!(
            CardTradeMode::device_default(false),
            CardTradeMode::SwipeTapInsertCard
        );
    }

    #[test]
    fn test_event_sender_outside_runtime() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        assert!(sender.emit(ReaderEvent::Connected));
        assert!(matches!(rx.try_recv(), Ok(ReaderEvent::Connected)));

        drop(rx);
        assert!(!sender.emit(ReaderEvent::Disconnected));
    }

    async fn drain(rx: &mut mpsc::Receiver<ReaderEvent>, count: i32) {
        drain_from(rx, 0, count).await;
    }

    async fn drain_from(rx: &mut mpsc::Receiver<ReaderEvent>, first: i32, end: i32) {
        for expected in first..end {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a queued event");
            assert_eq!(event, Some(ReaderEvent::PinInputResult(expected)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_waits_on_runtime_worker() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        let producer = tokio::spawn(async move {
            (0..10).all(|i| sender.emit(ReaderEvent::PinInputResult(i)))
        });
        drain(&mut rx, 10).await;
        assert!(producer.await.unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_defers_on_current_thread_runtime() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        for i in 0..10 {
            assert!(sender.emit(ReaderEvent::PinInputResult(i)));
        }
        drain(&mut rx, 5).await;
        // Capacity is free again, but the deferred events go first
        assert!(sender.emit(ReaderEvent::PinInputResult(10)));
        drain_from(&mut rx, 5, 11).await;
    }
}
