//! Transaction coordinator
//!
//! Owns the reader session and drives it through connect, trade, EMV application
//! selection, PIN entry and online authorization. Reader events arrive on a bounded
//! queue and are handled by a single event-loop task, so listeners observe them in
//! emission order and never run concurrently.
//!
//! Only [`TransactionCoordinator::connect`] and the terminal-id fetch inside
//! [`TransactionCoordinator::start_transaction`] wait for the reader, both with explicit
//! timeouts. Every other operation issues a command and returns; its outcome arrives
//! later as a [`TransactionEvent`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::authorization::{
    icc_card_number, AuthorizationError, AuthorizationRequest, AuthorizationResponse,
    IssuerAuthorizer, NETWORK_FAILURE_TLV,
};
use crate::config::TerminalConfig;
use crate::crypto::{build_pin_block, PinBlockContext, PinBlockError, MAX_PIN_LENGTH, MIN_PIN_LENGTH};
use crate::error::{Result, TerminalError};
use crate::events::{ReaderEvent, TradeResultKind, TransactionResultCode};
use crate::listener::{
    deliver_isolated, ConnectionEvent, ConnectionListener, ListenerId, ListenerRegistry,
    TransactionEvent, TransactionListener,
};
use crate::reader::{CardReader, ConnectionState, DecodedFields, EventSender};
use crate::result::{PaymentResult, PaymentResultBuilder, TransactionStatus};

/// Capacity of the queue between the reader and the event loop
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Format of the terminal time sent to the reader
pub const TERMINAL_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Failure message reported for a cancelled trade
pub const CANCEL_MESSAGE: &str = "Cancel";

const PIN_MAP_TIMEOUT_SECS: u64 = 20;

static NEXT_TRADE_ID: AtomicU64 = AtomicU64::new(1);

/// How the PIN is collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    /// Verified by the card
    Offline,
    /// Encrypted by the reader and verified by the issuer
    Online,
    /// Typed on the terminal and sent as an ISO-4 block
    Keypad,
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Disconnected,
    Connecting,
    /// Connected and ready for a trade
    Idle,
    TradeStarted,
    WaitingCard,
    CardPresented(TradeResultKind),
    EmvAppSelection,
    PinEntry(PinMode),
    OnlineAuthorization,
}

impl TransactionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, TransactionState::Disconnected | TransactionState::Connecting)
    }

    pub fn in_trade(&self) -> bool {
        self.is_connected() && *self != TransactionState::Idle
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Disconnected => f.write_str("disconnected"),
            TransactionState::Connecting => f.write_str("connecting"),
            TransactionState::Idle => f.write_str("idle"),
            TransactionState::TradeStarted => f.write_str("trade started"),
            TransactionState::WaitingCard => f.write_str("waiting for card"),
            TransactionState::CardPresented(kind) => write!(f, "card presented ({kind:?})"),
            TransactionState::EmvAppSelection => f.write_str("EMV application selection"),
            TransactionState::PinEntry(mode) => write!(f, "PIN entry ({mode:?})"),
            TransactionState::OnlineAuthorization => f.write_str("online authorization"),
        }
    }
}

/// How far the reader has been handed the trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TradePhase {
    /// Waiting for the terminal id; the reader has not been asked for a card
    AwaitingTerminalId,
    /// Trade parameters and `do_trade` are being sent
    IssuingTrade,
    /// The reader owns the trade; cancels go to the reader
    Trading,
}

/// The trade in flight
struct TradeSession {
    id: u64,
    phase: TradePhase,
    result: PaymentResultBuilder,
    cancel_requested: bool,
    app_count: usize,
    callback: Option<Arc<dyn TransactionListener>>,
}

#[derive(Default)]
struct Session {
    state: TransactionState,
    connection: Option<ConnectionState>,
    connecting: Option<ConnectionState>,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    pending_terminal_id: Option<oneshot::Sender<String>>,
    terminal_id: Option<String>,
    trade: Option<TradeSession>,
}

impl Session {
    fn transition(&mut self, next: TransactionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    /// Move to `next` only while a trade is active
    fn transition_in_trade(&mut self, next: TransactionState) {
        if self.trade.is_some() && self.state.is_connected() {
            self.transition(next);
        }
    }

    fn pin_mode(&self) -> Result<PinMode> {
        match self.state {
            TransactionState::PinEntry(mode) => Ok(mode),
            _ if self.trade.is_none() => Err(TerminalError::NoTradeInProgress),
            _ => Err(TerminalError::validation("no PIN entry requested")),
        }
    }
}

/// How a trade ended
enum Outcome {
    Completed,
    Approved,
    Failed { message: String, raw: Option<String> },
}

impl Outcome {
    fn failed(message: impl Into<String>, raw: Option<String>) -> Self {
        Outcome::Failed {
            message: message.into(),
            raw,
        }
    }
}

struct Inner {
    reader: Arc<dyn CardReader>,
    authorizer: Arc<dyn IssuerAuthorizer>,
    config: TerminalConfig,
    /// Events the coordinator raises itself, kept apart from the bounded reader queue
    loopback: mpsc::UnboundedSender<ReaderEvent>,
    connection_listeners: ListenerRegistry<dyn ConnectionListener>,
    transaction_listeners: ListenerRegistry<dyn TransactionListener>,
    session: Mutex<Session>,
}

/// Drives one card reader through payment transactions
///
/// Must be created inside a Tokio runtime; the event loop task is aborted on drop.
pub struct TransactionCoordinator {
    inner: Arc<Inner>,
    event_loop: JoinHandle<()>,
}

impl TransactionCoordinator {
    pub fn new(
        reader: Arc<dyn CardReader>,
        authorizer: Arc<dyn IssuerAuthorizer>,
        config: TerminalConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (loopback, loopback_rx) = mpsc::unbounded_channel();
        reader.attach(EventSender::new(tx));

        let inner = Arc::new(Inner {
            reader,
            authorizer,
            config,
            loopback,
            connection_listeners: ListenerRegistry::new(),
            transaction_listeners: ListenerRegistry::new(),
            session: Mutex::new(Session::default()),
        });
        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), rx, loopback_rx));

        Self { inner, event_loop }
    }

    pub fn state(&self) -> TransactionState {
        self.inner.session.lock().state
    }

    pub fn connection(&self) -> Option<ConnectionState> {
        self.inner.session.lock().connection.clone()
    }

    /// Terminal id last reported by the reader
    pub fn terminal_id(&self) -> Option<String> {
        self.inner.session.lock().terminal_id.clone()
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.inner.config
    }

    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.inner.connection_listeners.register(listener)
    }

    pub fn unregister_connection_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.unregister(id)
    }

    pub fn register_transaction_listener(
        &self,
        listener: Arc<dyn TransactionListener>,
    ) -> ListenerId {
        self.inner.transaction_listeners.register(listener)
    }

    pub fn unregister_transaction_listener(&self, id: ListenerId) -> bool {
        self.inner.transaction_listeners.unregister(id)
    }

    /// Connect to the reader at `address` and wait for it to answer
    ///
    /// The link type follows from the address (see [`ConnectionState::from_address`]).
    ///
    /// # Errors
    /// * [`TerminalError::AlreadyConnected`] - a connection exists or is being set up
    /// * [`TerminalError::NoDevice`] - the reader reported that no device is present
    /// * [`TerminalError::ConnectionTimeout`] - no answer within the connect timeout; the
    ///   session is back in `Disconnected`
    pub async fn connect(&self, address: &str) -> Result<()> {
        let connection = ConnectionState::from_address(address);
        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.inner.session.lock();
            if session.state != TransactionState::Disconnected {
                return Err(TerminalError::AlreadyConnected);
            }
            session.transition(TransactionState::Connecting);
            session.connecting = Some(connection.clone());
            session.pending_connect = Some(tx);
        }

        info!(connection = %connection, "Connecting to reader");
        if let Err(e) = self.inner.reader.connect(&connection) {
            let mut session = self.inner.session.lock();
            session.pending_connect = None;
            session.connecting = None;
            session.transition(TransactionState::Disconnected);
            return Err(e);
        }

        let bound = self.inner.config.connect_timeout();
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TerminalError::Disconnected),
            Err(_) => {
                let mut session = self.inner.session.lock();
                session.pending_connect = None;
                if session.state == TransactionState::Connecting {
                    session.transition(TransactionState::Disconnected);
                }
                warn!(connection = %connection, timeout = ?bound, "Reader did not answer the connect request");
                Err(TerminalError::ConnectionTimeout(bound))
            }
        }
    }

    /// Close the reader link; completion is reported as a connection event
    pub fn disconnect(&self) -> Result<()> {
        if self.inner.session.lock().state == TransactionState::Disconnected {
            return Err(TerminalError::NotConnected);
        }
        info!("Disconnecting reader");
        self.inner.reader.disconnect()
    }

    /// Start a trade for `amount`
    ///
    /// Fetches the terminal id, configures card-entry mode, amount, currency and
    /// transaction type from the terminal settings, then opens the reader for a card.
    /// `callback` receives this trade's events after the registered listeners and is
    /// released when the trade ends.
    ///
    /// # Errors
    /// * [`TerminalError::NotConnected`] - no reader connection; no command is issued
    /// * [`TerminalError::TradeInProgress`] - another trade has not finished yet
    /// * [`TerminalError::TransactionCancelled`] - cancelled before the card was requested
    ///
    /// A cancel that arrives while the trade parameters are being sent lets setup finish,
    /// then is forwarded to the reader; the trade ends with `TransactionFailed("Cancel")`.
    pub async fn start_transaction(
        &self,
        amount: &str,
        callback: Option<Arc<dyn TransactionListener>>,
    ) -> Result<()> {
        let transaction_type = self.inner.config.transaction_type();
        let (tx, rx) = oneshot::channel();
        let trade_id = {
            let mut session = self.inner.session.lock();
            match session.state {
                TransactionState::Disconnected | TransactionState::Connecting => {
                    return Err(TerminalError::NotConnected)
                }
                TransactionState::Idle => {}
                _ => return Err(TerminalError::TradeInProgress),
            }
            validate_amount(amount)?;

            let id = NEXT_TRADE_ID.fetch_add(1, Ordering::Relaxed);
            session.trade = Some(TradeSession {
                id,
                phase: TradePhase::AwaitingTerminalId,
                result: PaymentResultBuilder::new(amount, transaction_type),
                cancel_requested: false,
                app_count: 0,
                callback,
            });
            session.pending_terminal_id = Some(tx);
            session.transition(TransactionState::TradeStarted);
            id
        };
        info!(trade = trade_id, amount, transaction_type = %transaction_type, "Starting transaction");

        if let Err(e) = self.inner.reader.request_terminal_id() {
            self.inner.abandon_trade(trade_id);
            return Err(e);
        }
        let bound = self.inner.config.device_id_timeout();
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(terminal_id)) => debug!(trade = trade_id, terminal_id = %terminal_id, "Terminal id received"),
            _ => warn!(trade = trade_id, timeout = ?bound, "Reader did not report its terminal id"),
        }

        {
            let mut session = self.inner.session.lock();
            session.pending_terminal_id = None;
            let connected = session.state.is_connected();
            match session.trade.as_mut() {
                Some(trade) if trade.id == trade_id && !trade.cancel_requested => {
                    trade.phase = TradePhase::IssuingTrade;
                }
                _ if !connected => return Err(TerminalError::Disconnected),
                _ => {
                    info!(trade = trade_id, "Transaction cancelled before the card was requested");
                    return Err(TerminalError::TransactionCancelled);
                }
            }
        }

        let config = &self.inner.config;
        let reader = &self.inner.reader;
        let issued = reader
            .set_card_trade_mode(config.card_trade_mode())
            .and_then(|()| {
                reader.set_amount(amount, "", &config.currency_code_str(), transaction_type)
            })
            .and_then(|()| reader.do_trade(config.trade_timeout_secs));
        if let Err(e) = issued {
            error!(trade = trade_id, error = %e, "Reader rejected the trade setup");
            self.inner.abandon_trade(trade_id);
            return Err(e);
        }

        let cancel_requested = {
            let mut session = self.inner.session.lock();
            let Some(trade) = session.trade.as_mut().filter(|t| t.id == trade_id) else {
                // Ended while being issued, e.g. by a disconnect
                return Ok(());
            };
            trade.phase = TradePhase::Trading;
            let cancel_requested = trade.cancel_requested;
            if session.state == TransactionState::TradeStarted {
                session.transition(TransactionState::WaitingCard);
            }
            cancel_requested
        };

        if cancel_requested {
            info!(trade = trade_id, "Forwarding cancel requested during trade setup");
            return self.inner.reader.cancel_trade();
        }
        Ok(())
    }

    /// Ask the reader to cancel the trade
    ///
    /// The trade ends when the reader acknowledges, with a single
    /// `TransactionFailed("Cancel")`. A cancel that arrives while the trade is still
    /// being issued is forwarded by [`start_transaction`](Self::start_transaction) once
    /// `do_trade` has gone out.
    pub fn cancel_transaction(&self) -> Result<()> {
        let phase = {
            let mut session = self.inner.session.lock();
            let trade = session
                .trade
                .as_mut()
                .ok_or(TerminalError::NoTradeInProgress)?;
            trade.cancel_requested = true;
            trade.phase
        };

        info!(?phase, "Cancelling transaction");
        match phase {
            // The reader has not been asked for a card yet; acknowledge locally
            TradePhase::AwaitingTerminalId => {
                if self.inner.loopback.send(ReaderEvent::TradeCancelled).is_err() {
                    warn!("Event loop stopped, ending the trade directly");
                    self.inner.finish_trade(Outcome::failed(CANCEL_MESSAGE, None));
                }
                Ok(())
            }
            TradePhase::IssuingTrade => Ok(()),
            TradePhase::Trading => self.inner.reader.cancel_trade(),
        }
    }

    /// Choose one of the applications offered by a `SelectEmvApp` event
    pub fn select_emv_app(&self, index: usize) -> Result<()> {
        {
            let mut session = self.inner.session.lock();
            if session.state != TransactionState::EmvAppSelection {
                return Err(TerminalError::validation("no EMV application selection pending"));
            }
            let count = session.trade.as_ref().map_or(0, |t| t.app_count);
            if index >= count {
                return Err(TerminalError::validation(format!(
                    "application index {index} out of range, {count} offered"
                )));
            }
            session.transition(TransactionState::CardPresented(TradeResultKind::Icc));
        }
        info!(index, "EMV application selected");
        self.inner.reader.select_emv_app(index)
    }

    pub fn cancel_select_emv_app(&self) -> Result<()> {
        if self.inner.session.lock().state != TransactionState::EmvAppSelection {
            return Err(TerminalError::validation("no EMV application selection pending"));
        }
        self.inner.reader.cancel_select_emv_app()
    }

    /// Answer a PIN request
    ///
    /// For keypad entry the digits are turned into an ISO-4 block with the reader's
    /// per-transaction key and nonce; otherwise they go to the reader, which builds the
    /// block itself.
    pub fn submit_pin(&self, pin: &str) -> Result<()> {
        let mode = self.inner.session.lock().pin_mode()?;
        match mode {
            PinMode::Keypad => {
                let fields = self.inner.reader.encrypt_data()?;
                let context = PinBlockContext::from_fields(&fields);
                let block = build_pin_block(&context, pin)?;
                debug!(online = context.is_online_pin, "Sending keypad PIN block");
                self.inner.reader.send_cvm_pin(&block, true)
            }
            PinMode::Online | PinMode::Offline => {
                validate_pin(pin)?;
                debug!(?mode, "Sending PIN to reader");
                self.inner.reader.send_pin(pin)
            }
        }
    }

    /// Continue without a PIN
    pub fn bypass_pin(&self) -> Result<()> {
        self.inner.session.lock().pin_mode()?;
        info!("Bypassing PIN entry");
        self.inner.reader.send_pin("")
    }

    /// Abort PIN entry; the reader ends the trade
    pub fn cancel_pin(&self) -> Result<()> {
        self.inner.session.lock().pin_mode()?;
        info!("Cancelling PIN entry");
        self.inner.reader.cancel_pin()
    }

    pub fn submit_pin_map(&self, value: &str) -> Result<()> {
        if self.inner.session.lock().trade.is_none() {
            return Err(TerminalError::NoTradeInProgress);
        }
        self.inner.reader.pin_map_sync(value, PIN_MAP_TIMEOUT_SECS)
    }

    /// Send a terminal time in `yyyyMMddHHmmss` form
    pub fn send_time(&self, terminal_time: &str) -> Result<()> {
        if terminal_time.len() != 14 || !terminal_time.chars().all(|c| c.is_ascii_digit()) {
            return Err(TerminalError::validation(format!(
                "terminal time must be 14 digits (yyyyMMddHHmmss), got {terminal_time:?}"
            )));
        }
        self.inner.reader.send_time(terminal_time)
    }

    pub fn send_current_time(&self) -> Result<()> {
        self.send_time(&current_terminal_time())
    }

    /// Authorize a swiped or tapped card with the issuer
    ///
    /// Chip cards are authorized by the coordinator itself during online processing;
    /// magnetic-stripe and contactless results need no reader feedback and are sent
    /// through here.
    pub async fn authorize_completed(&self, result: &PaymentResult) -> Result<AuthorizationResponse> {
        let terminal_id = self.terminal_id().unwrap_or_default();
        let request = AuthorizationRequest::new(
            &terminal_id,
            &result.amount,
            &result.card.masked_pan,
            result.transaction_type,
            Local::now(),
        );

        let bound = self.inner.config.authorization_timeout();
        let response = tokio::time::timeout(bound, self.inner.authorizer.authorize(&request))
            .await
            .map_err(|_| AuthorizationError::Timeout(bound))??;
        info!(ok = response.ok, code = response.response_code(), card_org = %request.card_org, "Issuer answered");
        Ok(response)
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut reader_rx: mpsc::Receiver<ReaderEvent>,
    mut loopback_rx: mpsc::UnboundedReceiver<ReaderEvent>,
) {
    debug!("Event loop started");
    loop {
        let event = tokio::select! {
            biased;
            Some(event) = loopback_rx.recv() => event,
            Some(event) = reader_rx.recv() => event,
            else => break,
        };
        inner.handle_event(event);
    }
    debug!("Event loop stopped");
}

impl Inner {
    fn handle_event(&self, event: ReaderEvent) {
        debug!(?event, "Reader event");
        match event {
            ReaderEvent::Connected => self.on_connected(),
            ReaderEvent::Disconnected => self.on_disconnected(),
            ReaderEvent::NoDeviceDetected => self.on_no_device(),
            ReaderEvent::TerminalId(id) => self.on_terminal_id(id),
            ReaderEvent::DoTradeResult { kind, fields } => self.on_trade_result(kind, &fields),
            ReaderEvent::TransactionResult(code) => self.on_transaction_result(code),
            ReaderEvent::WaitingUser => {
                {
                    let mut session = self.session.lock();
                    if session.state == TransactionState::TradeStarted {
                        session.transition(TransactionState::WaitingCard);
                    }
                }
                self.dispatch(TransactionEvent::WaitingUser);
            }
            ReaderEvent::RequestTime => {
                if self.config.auto_send_time {
                    if let Err(e) = self.reader.send_time(&current_terminal_time()) {
                        warn!(error = %e, "Failed to send terminal time");
                    }
                }
                self.dispatch(TransactionEvent::RequestTime);
            }
            ReaderEvent::SelectEmvApp(apps) => {
                {
                    let mut session = self.session.lock();
                    if let Some(trade) = session.trade.as_mut() {
                        trade.app_count = apps.len();
                    }
                    session.transition_in_trade(TransactionState::EmvAppSelection);
                }
                self.dispatch(TransactionEvent::SelectEmvApp(apps));
            }
            ReaderEvent::OnlineProcess(tlv) => self.on_online_process(tlv),
            ReaderEvent::BatchData(tlv) | ReaderEvent::ReversalData(tlv) => self.on_batch_data(tlv),
            ReaderEvent::SetPin { offline, tries } => {
                let mode = if offline { PinMode::Offline } else { PinMode::Online };
                self.session
                    .lock()
                    .transition_in_trade(TransactionState::PinEntry(mode));
                self.dispatch(TransactionEvent::PinRequested { offline, tries });
            }
            ReaderEvent::SetPinKeypad => {
                self.session
                    .lock()
                    .transition_in_trade(TransactionState::PinEntry(PinMode::Keypad));
                self.dispatch(TransactionEvent::PinKeypadRequested);
            }
            ReaderEvent::PinInputResult(digits) => {
                self.dispatch(TransactionEvent::PinInputProgress(digits))
            }
            ReaderEvent::PinMapResult { keys, offline_time } => {
                self.dispatch(TransactionEvent::PinMapResult { keys, offline_time })
            }
            ReaderEvent::Display(code) => self.dispatch(TransactionEvent::Display {
                code,
                message: code.message().to_string(),
            }),
            ReaderEvent::Error(code) => {
                warn!(code = code.name(), "Reader reported an error");
                self.finish_trade(Outcome::failed(code.message(), Some(code.name().to_string())));
            }
            ReaderEvent::IccExceptionData(tlv) => {
                self.finish_trade(Outcome::failed("Decline", Some(tlv)));
            }
            ReaderEvent::CardInfo(fields) => {
                if let Some(trade) = self.session.lock().trade.as_mut() {
                    trade.result.absorb(&fields);
                }
                self.dispatch(TransactionEvent::CardInfoResult(fields));
            }
            ReaderEvent::TradeCancelled => {
                self.finish_trade(Outcome::failed(CANCEL_MESSAGE, None));
            }
        }
    }

    fn on_connected(&self) {
        let pending = {
            let mut session = self.session.lock();
            if let Some(connection) = session.connecting.take() {
                session.connection = Some(connection);
            }
            if !session.state.is_connected() {
                session.transition(TransactionState::Idle);
            }
            session.pending_connect.take()
        };
        match &pending {
            Some(_) => info!("Reader connected"),
            None => warn!("Reader connected without a pending connect request"),
        }
        if let Some(pending) = pending {
            let _ = pending.send(Ok(()));
        }
        self.connection_listeners.notify(&ConnectionEvent::Connected);
    }

    fn on_disconnected(&self) {
        let (pending, in_trade) = {
            let mut session = self.session.lock();
            session.connection = None;
            session.connecting = None;
            session.transition(TransactionState::Disconnected);
            (session.pending_connect.take(), session.trade.is_some())
        };
        info!("Reader disconnected");
        if let Some(pending) = pending {
            let _ = pending.send(Err(TerminalError::Disconnected));
        }
        if in_trade {
            self.finish_trade(Outcome::failed("Device disconnected", None));
        }
        self.connection_listeners.notify(&ConnectionEvent::Disconnected);
    }

    fn on_no_device(&self) {
        let (pending, in_trade) = {
            let mut session = self.session.lock();
            session.connection = None;
            session.connecting = None;
            session.transition(TransactionState::Disconnected);
            (session.pending_connect.take(), session.trade.is_some())
        };
        warn!("No reader device detected");
        if let Some(pending) = pending {
            let _ = pending.send(Err(TerminalError::NoDevice));
        }
        if in_trade {
            self.finish_trade(Outcome::failed("No device detected", None));
        }
        self.connection_listeners
            .notify(&ConnectionEvent::NoDeviceDetected);
    }

    fn on_terminal_id(&self, id: String) {
        let pending = {
            let mut session = self.session.lock();
            session.terminal_id = Some(id.clone());
            session.pending_terminal_id.take()
        };
        if let Some(pending) = pending {
            let _ = pending.send(id);
        }
    }

    fn on_trade_result(&self, kind: TradeResultKind, fields: &DecodedFields) {
        {
            let mut session = self.session.lock();
            let Some(trade) = session.trade.as_mut() else {
                warn!(?kind, "Trade result without an active trade, dropped");
                return;
            };
            trade.result.absorb(fields).set_presentment(kind);
            session.transition(TransactionState::CardPresented(kind));
        }
        info!(?kind, "Card presented");

        match kind {
            TradeResultKind::Icc => {
                self.dispatch(TransactionEvent::CardInserted);
                if let Err(e) = self.reader.start_emv() {
                    error!(error = %e, "Failed to start EMV processing");
                    self.finish_trade(Outcome::failed(
                        "Failed to start chip processing",
                        Some(e.to_string()),
                    ));
                }
            }
            TradeResultKind::Mcr => self.finish_trade(Outcome::Completed),
            TradeResultKind::NfcOnline | TradeResultKind::NfcOffline => {
                match self.reader.nfc_batch_data() {
                    Ok(batch) => {
                        if let Some(tlv) = batch.get("tlv") {
                            debug!(tlv = %tlv, "Contactless batch data");
                            if let Some(trade) = self.session.lock().trade.as_mut() {
                                trade.result.set_tlv(tlv.clone());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to read contactless batch data"),
                }
                self.finish_trade(Outcome::Completed);
            }
            other => self.finish_trade(Outcome::failed(other.message(), None)),
        }
    }

    fn on_transaction_result(&self, code: TransactionResultCode) {
        match code {
            TransactionResultCode::Approved => self.finish_trade(Outcome::Approved),
            other => self.finish_trade(Outcome::failed(other.message(), None)),
        }
    }

    fn on_batch_data(&self, tlv: String) {
        debug!(tlv = %tlv, "Batch data received");
        let snapshot = {
            let mut session = self.session.lock();
            session.trade.as_mut().map(|trade| {
                trade.result.set_tlv(tlv);
                trade.result.snapshot(TransactionStatus::Completed)
            })
        };
        match snapshot {
            Some(result) => self.dispatch(TransactionEvent::TransactionCompleted(result)),
            None => warn!("Batch data without an active trade, dropped"),
        }
    }

    /// Decode the chip data, ask the issuer and feed its answer back to the card
    fn on_online_process(&self, tlv: String) {
        debug!(tlv = %tlv, "Online processing requested");
        self.session
            .lock()
            .transition_in_trade(TransactionState::OnlineAuthorization);
        self.dispatch(TransactionEvent::OnlineProcess { tlv: tlv.clone() });

        let fields = self.reader.analyse_icc_data(&tlv).unwrap_or_else(|e| {
            warn!(error = %e, "Reader could not analyse the ICC data");
            DecodedFields::new()
        });
        let card_number = match icc_card_number(&fields, &tlv) {
            Ok(number) => number,
            Err(e) => {
                warn!(error = %e, "Malformed ICC data, declining");
                self.send_online_result(NETWORK_FAILURE_TLV);
                self.finish_trade(Outcome::failed("Malformed ICC data", Some(tlv)));
                return;
            }
        };

        let request = {
            let mut session = self.session.lock();
            let terminal_id = session.terminal_id.clone().unwrap_or_default();
            session.trade.as_mut().map(|trade| {
                trade.result.absorb(&fields);
                if !card_number.is_empty() {
                    trade.result.set_masked_pan(card_number.clone());
                }
                AuthorizationRequest::new(
                    &terminal_id,
                    trade.result.amount(),
                    &card_number,
                    trade.result.transaction_type(),
                    Local::now(),
                )
            })
        };
        let Some(request) = request else {
            warn!("Online processing without an active trade, declining");
            self.send_online_result(NETWORK_FAILURE_TLV);
            return;
        };

        let reader = Arc::clone(&self.reader);
        let authorizer = Arc::clone(&self.authorizer);
        let bound = self.config.authorization_timeout();
        tokio::spawn(async move {
            let result_tlv = match tokio::time::timeout(bound, authorizer.authorize(&request)).await {
                Ok(Ok(response)) => {
                    info!(ok = response.ok, code = response.response_code(), card_org = %request.card_org, "Issuer answered");
                    response.online_result_tlv()
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Authorization failed, declining");
                    NETWORK_FAILURE_TLV.to_string()
                }
                Err(_) => {
                    warn!(timeout = ?bound, "Issuer did not answer, declining");
                    NETWORK_FAILURE_TLV.to_string()
                }
            };
            if let Err(e) = reader.send_online_process_result(&result_tlv) {
                error!(error = %e, "Failed to send the online result to the reader");
            }
        });
    }

    fn send_online_result(&self, tlv: &str) {
        if let Err(e) = self.reader.send_online_process_result(tlv) {
            error!(error = %e, "Failed to send the online result to the reader");
        }
    }

    /// Drop a trade that never reached the reader; the caller gets the error instead
    fn abandon_trade(&self, trade_id: u64) {
        let mut session = self.session.lock();
        if session.trade.as_ref().is_some_and(|t| t.id == trade_id) {
            session.trade = None;
            session.pending_terminal_id = None;
            if session.state.is_connected() {
                session.transition(TransactionState::Idle);
            }
        }
    }

    /// End the active trade with exactly one terminal notification
    fn finish_trade(&self, outcome: Outcome) {
        let (event, callback) = {
            let mut session = self.session.lock();
            let Some(trade) = session.trade.take() else {
                warn!("Terminal event without an active trade, dropped");
                return;
            };
            session.pending_terminal_id = None;
            if session.state.is_connected() {
                session.transition(TransactionState::Idle);
            }

            let TradeSession {
                id,
                result,
                cancel_requested,
                callback,
                ..
            } = trade;
            let event = match outcome {
                Outcome::Completed => {
                    TransactionEvent::TransactionCompleted(result.build(TransactionStatus::Completed))
                }
                Outcome::Approved => {
                    TransactionEvent::TransactionResult(result.build(TransactionStatus::Approved))
                }
                Outcome::Failed { .. } if cancel_requested => {
                    TransactionEvent::failed(CANCEL_MESSAGE, None)
                }
                Outcome::Failed { message, raw } => TransactionEvent::failed(message, raw),
            };
            info!(trade = id, outcome = event.name(), "Transaction finished");
            (event, callback)
        };
        self.deliver(&event, callback);
    }

    fn dispatch(&self, event: TransactionEvent) {
        let callback = self
            .session
            .lock()
            .trade
            .as_ref()
            .and_then(|t| t.callback.clone());
        self.deliver(&event, callback);
    }

    fn deliver(&self, event: &TransactionEvent, callback: Option<Arc<dyn TransactionListener>>) {
        self.transaction_listeners.notify(event);
        if let Some(callback) = callback {
            deliver_isolated(event.name(), || callback.on_event(event));
        }
    }
}

fn current_terminal_time() -> String {
    Local::now().format(TERMINAL_TIME_FORMAT).to_string()
}

/// Amounts are decimal strings such as `1000` or `10.00`
fn validate_amount(amount: &str) -> Result<()> {
    let dots = amount.chars().filter(|&c| c == '.').count();
    let valid = !amount.is_empty()
        && dots <= 1
        && amount.chars().any(|c| c.is_ascii_digit())
        && amount.chars().all(|c| c.is_ascii_digit() || c == '.');
    if valid {
        Ok(())
    } else {
        Err(TerminalError::validation(format!("invalid amount {amount:?}")))
    }
}

fn validate_pin(pin: &str) -> Result<()> {
    if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&pin.len()) {
        return Err(PinBlockError::InvalidPinLength(pin.len()).into());
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(PinBlockError::InvalidPinDigits.into());
    }
    Ok(())
}
