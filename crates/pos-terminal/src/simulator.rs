//! Scripted card reader
//!
//! [`SimulatedReader`] stands in for the vendor SDK. Commands are recorded and handed to
//! a worker thread, which answers with the events a real reader would send according
//! to a [`Scenario`]. Events leave that thread in command order, the same way SDK
//! callbacks arrive from a foreign thread.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::authorization::online_result_tlv;
use crate::error::{Result, TerminalError};
use crate::events::{DisplayCode, ReaderEvent, TradeResultKind, TransactionResultCode};
use crate::reader::{
    CardReader, CardTradeMode, ConnectionState, DecodedFields, EventSender, TransactionType,
};

/// AES session key handed out for keypad PIN entry
pub const SIMULATED_PIN_KEY: &str = "000102030405060708090A0B0C0D0E0F";

/// Card-entry nonce handed out for keypad PIN entry
pub const SIMULATED_RANDOM_DATA: &str = "1F2E3D4C5B6A79880011223344556677";

/// Contactless batch TLV returned after a tap
pub const SIMULATED_NFC_BATCH_TLV: &str = "9F2608A1B2C3D4E5F60718";

/// Batch TLV returned after an approved chip transaction
pub const SIMULATED_ICC_BATCH_TLV: &str = "9F2608C0FFEE00C0FFEE008A023030";

/// Card the simulated cardholder presents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedCard {
    Icc,
    Mcr,
    Nfc,
    /// Nobody presents a card; the trade only ends on cancel
    Absent,
}

/// PIN request raised after application selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedPin {
    None,
    Online,
    Offline,
    Keypad,
}

/// Behaviour of a [`SimulatedReader`]
#[derive(Debug, Clone)]
pub struct Scenario {
    /// `false` answers connect with "no device detected"
    pub device_present: bool,
    /// `false` never answers connect at all
    pub answers_connect: bool,
    /// `None` never answers the terminal-id request
    pub terminal_id: Option<String>,
    pub card: SimulatedCard,
    pub pan: String,
    pub emv_apps: Vec<String>,
    pub pin: SimulatedPin,
    /// `formatID` reported when analysing ICC data; `32` carries the PAN in `maskedPAN`
    pub icc_format_id: String,
    /// Send a truncated TLV with the online-process request
    pub corrupt_icc_data: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            device_present: true,
            answers_connect: true,
            terminal_id: Some("SIM00000001".to_string()),
            card: SimulatedCard::Icc,
            pan: "4761739001010010".to_string(),
            emv_apps: vec!["VISA CREDIT".to_string()],
            pin: SimulatedPin::None,
            icc_format_id: "30".to_string(),
            corrupt_icc_data: false,
        }
    }
}

impl Scenario {
    /// PAN with everything but the first six and last four digits masked
    pub fn masked_pan(&self) -> String {
        mask_pan(&self.pan, '*')
    }

    /// Online-process TLV: terminal AID, amount-independent tags and the masked PAN in `C4`
    pub fn icc_tlv(&self) -> String {
        if self.corrupt_icc_data {
            return "9F0607A0000000031010C40A4761".to_string();
        }
        let mut pan = mask_pan(&self.pan, 'F');
        if pan.len() % 2 == 1 {
            pan.push('F');
        }
        format!(
            "9F0607A00000000310105F2A020156C4{:02X}{}",
            pan.len() / 2,
            pan
        )
    }
}

fn mask_pan(pan: &str, fill: char) -> String {
    if pan.len() <= 10 {
        return pan.to_string();
    }
    let middle = pan.len() - 10;
    format!(
        "{}{}{}",
        &pan[..6],
        fill.to_string().repeat(middle),
        &pan[pan.len() - 4..]
    )
}

/// Command received by a [`SimulatedReader`], as recorded in its log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderCommand {
    Connect(ConnectionState),
    Disconnect,
    RequestTerminalId,
    SetCardTradeMode(CardTradeMode),
    SetAmount {
        amount: String,
        cashback_amount: String,
        currency_code: String,
        transaction_type: TransactionType,
    },
    DoTrade(u64),
    CancelTrade,
    StartEmv,
    SelectEmvApp(usize),
    CancelSelectEmvApp,
    SendTime(String),
    /// Plain PIN; only whether it was a bypass is recorded
    SendPin { bypass: bool },
    SendCvmPin { pin_block: String, encrypted: bool },
    PinMapSync(String),
    CancelPin,
    SendOnlineProcessResult(String),
    EncryptData,
    NfcBatchData,
    AnalyseIccData,
}

enum WorkerMessage {
    Attach(EventSender),
    Command(ReaderCommand),
    Inject(ReaderEvent),
}

/// Reader double driven by a [`Scenario`]
pub struct SimulatedReader {
    scenario: Scenario,
    log: Mutex<Vec<ReaderCommand>>,
    worker_tx: Mutex<Sender<WorkerMessage>>,
}

impl SimulatedReader {
    /// Spawn the worker thread; it stops when the reader is dropped
    pub fn new(scenario: Scenario) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel();
        let worker_scenario = scenario.clone();
        thread::spawn(move || Worker::new(worker_scenario).run(worker_rx));

        Self {
            scenario,
            log: Mutex::new(Vec::new()),
            worker_tx: Mutex::new(worker_tx),
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<ReaderCommand> {
        self.log.lock().clone()
    }

    /// Emit `event` from the worker thread, after the events already queued
    pub fn inject(&self, event: ReaderEvent) {
        self.post(WorkerMessage::Inject(event));
    }

    fn post(&self, message: WorkerMessage) {
        if self.worker_tx.lock().send(message).is_err() {
            warn!("Simulated reader worker has stopped");
        }
    }

    fn command(&self, command: ReaderCommand) -> Result<()> {
        self.record(command.clone());
        self.post(WorkerMessage::Command(command));
        Ok(())
    }

    fn record(&self, command: ReaderCommand) {
        debug!(?command, "Simulated reader command");
        self.log.lock().push(command);
    }
}

impl CardReader for SimulatedReader {
    fn attach(&self, events: EventSender) {
        self.post(WorkerMessage::Attach(events));
    }

    fn connect(&self, connection: &ConnectionState) -> Result<()> {
        self.command(ReaderCommand::Connect(connection.clone()))
    }

    fn disconnect(&self) -> Result<()> {
        self.command(ReaderCommand::Disconnect)
    }

    fn request_terminal_id(&self) -> Result<()> {
        self.command(ReaderCommand::RequestTerminalId)
    }

    fn set_card_trade_mode(&self, mode: CardTradeMode) -> Result<()> {
        self.command(ReaderCommand::SetCardTradeMode(mode))
    }

    fn set_amount(
        &self,
        amount: &str,
        cashback_amount: &str,
        currency_code: &str,
        transaction_type: TransactionType,
    ) -> Result<()> {
        self.command(ReaderCommand::SetAmount {
            amount: amount.to_string(),
            cashback_amount: cashback_amount.to_string(),
            currency_code: currency_code.to_string(),
            transaction_type,
        })
    }

    fn do_trade(&self, timeout_secs: u64) -> Result<()> {
        self.command(ReaderCommand::DoTrade(timeout_secs))
    }

    fn cancel_trade(&self) -> Result<()> {
        self.command(ReaderCommand::CancelTrade)
    }

    fn start_emv(&self) -> Result<()> {
        self.command(ReaderCommand::StartEmv)
    }

    fn select_emv_app(&self, index: usize) -> Result<()> {
        if index >= self.scenario.emv_apps.len() {
            return Err(TerminalError::hardware(format!("no EMV application at {index}")));
        }
        self.command(ReaderCommand::SelectEmvApp(index))
    }

    fn cancel_select_emv_app(&self) -> Result<()> {
        self.command(ReaderCommand::CancelSelectEmvApp)
    }

    fn send_time(&self, terminal_time: &str) -> Result<()> {
        self.command(ReaderCommand::SendTime(terminal_time.to_string()))
    }

    fn send_pin(&self, pin: &str) -> Result<()> {
        self.command(ReaderCommand::SendPin {
            bypass: pin.is_empty(),
        })
    }

    fn send_cvm_pin(&self, pin_block: &str, encrypted: bool) -> Result<()> {
        self.command(ReaderCommand::SendCvmPin {
            pin_block: pin_block.to_string(),
            encrypted,
        })
    }

    fn pin_map_sync(&self, value: &str, _timeout_secs: u64) -> Result<()> {
        self.command(ReaderCommand::PinMapSync(value.to_string()))
    }

    fn cancel_pin(&self) -> Result<()> {
        self.command(ReaderCommand::CancelPin)
    }

    fn send_online_process_result(&self, tlv_hex: &str) -> Result<()> {
        self.command(ReaderCommand::SendOnlineProcessResult(tlv_hex.to_string()))
    }

    fn encrypt_data(&self) -> Result<DecodedFields> {
        self.record(ReaderCommand::EncryptData);
        Ok(HashMap::from([
            ("RandomData".to_string(), SIMULATED_RANDOM_DATA.to_string()),
            ("PAN".to_string(), self.scenario.pan.clone()),
            ("AESKey".to_string(), SIMULATED_PIN_KEY.to_string()),
            ("isOnlinePin".to_string(), "true".to_string()),
            ("pinTryLimit".to_string(), "3".to_string()),
        ]))
    }

    fn nfc_batch_data(&self) -> Result<DecodedFields> {
        self.record(ReaderCommand::NfcBatchData);
        Ok(HashMap::from([(
            "tlv".to_string(),
            SIMULATED_NFC_BATCH_TLV.to_string(),
        )]))
    }

    fn analyse_icc_data(&self, _tlv_hex: &str) -> Result<DecodedFields> {
        self.record(ReaderCommand::AnalyseIccData);
        let mut fields = HashMap::from([
            ("formatID".to_string(), self.scenario.icc_format_id.clone()),
            ("expiryDate".to_string(), "2812".to_string()),
        ]);
        if self.scenario.icc_format_id == "32" {
            fields.insert("maskedPAN".to_string(), self.scenario.masked_pan());
        }
        Ok(fields)
    }
}

/// State of the simulated device, owned by the worker thread
struct Worker {
    scenario: Scenario,
    events: Option<EventSender>,
    trading: bool,
}

impl Worker {
    fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            events: None,
            trading: false,
        }
    }

    fn run(mut self, rx: Receiver<WorkerMessage>) {
        info!("Simulated reader worker started");
        while let Ok(message) = rx.recv() {
            match message {
                WorkerMessage::Attach(events) => self.events = Some(events),
                WorkerMessage::Inject(event) => self.emit(event),
                WorkerMessage::Command(command) => self.handle(command),
            }
        }
        info!("Simulated reader worker stopped");
    }

    fn emit(&self, event: ReaderEvent) {
        match &self.events {
            Some(events) => {
                if !events.emit(event) {
                    warn!("Simulated reader event was not delivered");
                }
            }
            None => warn!(?event, "Simulated reader is not attached, event dropped"),
        }
    }

    fn handle(&mut self, command: ReaderCommand) {
        match command {
            ReaderCommand::Connect(_) => {
                if !self.scenario.answers_connect {
                    return;
                }
                if self.scenario.device_present {
                    self.emit(ReaderEvent::Connected);
                } else {
                    self.emit(ReaderEvent::NoDeviceDetected);
                }
            }
            ReaderCommand::Disconnect => {
                self.trading = false;
                self.emit(ReaderEvent::Disconnected);
            }
            ReaderCommand::RequestTerminalId => {
                if let Some(id) = self.scenario.terminal_id.clone() {
                    self.emit(ReaderEvent::TerminalId(id));
                }
            }
            ReaderCommand::DoTrade(_) => self.present_card(),
            ReaderCommand::CancelTrade | ReaderCommand::CancelSelectEmvApp | ReaderCommand::CancelPin => {
                if std::mem::take(&mut self.trading) {
                    self.emit(ReaderEvent::TransactionResult(TransactionResultCode::Cancel));
                }
            }
            ReaderCommand::StartEmv => {
                self.emit(ReaderEvent::RequestTime);
                if self.scenario.emv_apps.len() > 1 {
                    self.emit(ReaderEvent::SelectEmvApp(self.scenario.emv_apps.clone()));
                } else {
                    self.request_pin();
                }
            }
            ReaderCommand::SelectEmvApp(_) => self.request_pin(),
            ReaderCommand::SendPin { .. } | ReaderCommand::SendCvmPin { .. } => {
                self.emit(ReaderEvent::PinInputResult(-1));
                self.go_online();
            }
            ReaderCommand::PinMapSync(_) => self.emit(ReaderEvent::PinMapResult {
                keys: (0..10).map(|d| d.to_string()).collect(),
                offline_time: 0,
            }),
            ReaderCommand::SendOnlineProcessResult(tlv) => self.complete_online(&tlv),
            ReaderCommand::SetCardTradeMode(_)
            | ReaderCommand::SetAmount { .. }
            | ReaderCommand::SendTime(_)
            | ReaderCommand::EncryptData
            | ReaderCommand::NfcBatchData
            | ReaderCommand::AnalyseIccData => {}
        }
    }

    fn present_card(&mut self) {
        self.trading = true;
        self.emit(ReaderEvent::WaitingUser);

        let swiped_fields = || {
            HashMap::from([
                ("formatID".to_string(), "30".to_string()),
                ("maskedPAN".to_string(), self.scenario.masked_pan()),
                ("expiryDate".to_string(), "2812".to_string()),
                ("cardholderName".to_string(), "SIMULATED/CARDHOLDER".to_string()),
                ("serviceCode".to_string(), "201".to_string()),
                ("track2Length".to_string(), "37".to_string()),
                ("encTrack2".to_string(), "5A2B6C1D7E3F8091".to_string()),
                ("trackksn".to_string(), "FFFF9876543210E00001".to_string()),
            ])
        };

        match self.scenario.card {
            SimulatedCard::Absent => {}
            SimulatedCard::Icc => self.emit(ReaderEvent::DoTradeResult {
                kind: TradeResultKind::Icc,
                fields: DecodedFields::new(),
            }),
            SimulatedCard::Mcr => {
                self.trading = false;
                self.emit(ReaderEvent::DoTradeResult {
                    kind: TradeResultKind::Mcr,
                    fields: swiped_fields(),
                });
            }
            SimulatedCard::Nfc => {
                self.trading = false;
                self.emit(ReaderEvent::DoTradeResult {
                    kind: TradeResultKind::NfcOnline,
                    fields: swiped_fields(),
                });
            }
        }
    }

    fn request_pin(&self) {
        match self.scenario.pin {
            SimulatedPin::None => self.go_online(),
            SimulatedPin::Online => self.emit(ReaderEvent::SetPin {
                offline: false,
                tries: 3,
            }),
            SimulatedPin::Offline => self.emit(ReaderEvent::SetPin {
                offline: true,
                tries: 3,
            }),
            SimulatedPin::Keypad => self.emit(ReaderEvent::SetPinKeypad),
        }
    }

    fn go_online(&self) {
        self.emit(ReaderEvent::Display(DisplayCode::PleaseWait));
        self.emit(ReaderEvent::OnlineProcess(self.scenario.icc_tlv()));
    }

    fn complete_online(&mut self, tlv: &str) {
        if !std::mem::take(&mut self.trading) {
            return;
        }
        self.emit(ReaderEvent::Display(DisplayCode::RemoveCard));
        if tlv.eq_ignore_ascii_case(&online_result_tlv("00")) {
            self.emit(ReaderEvent::BatchData(SIMULATED_ICC_BATCH_TLV.to_string()));
            self.emit(ReaderEvent::TransactionResult(TransactionResultCode::Approved));
        } else {
            self.emit(ReaderEvent::ReversalData(tlv.to_string()));
            self.emit(ReaderEvent::TransactionResult(TransactionResultCode::Declined));
        }
    }
}
