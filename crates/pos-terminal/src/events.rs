//! Events reported by the card reader and their human-readable messages

use serde::Serialize;

use crate::reader::DecodedFields;

/// Raw event pushed by a reader into the coordinator queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Connected,
    Disconnected,
    NoDeviceDetected,
    /// Answer to a terminal-id request
    TerminalId(String),
    DoTradeResult {
        kind: TradeResultKind,
        fields: DecodedFields,
    },
    TransactionResult(TransactionResultCode),
    WaitingUser,
    RequestTime,
    SelectEmvApp(Vec<String>),
    OnlineProcess(String),
    BatchData(String),
    ReversalData(String),
    /// PIN requested with the remaining try count
    SetPin {
        offline: bool,
        tries: u32,
    },
    /// PIN requested through the terminal keypad with an ISO-4 block
    SetPinKeypad,
    PinInputResult(i32),
    PinMapResult {
        keys: Vec<String>,
        offline_time: i32,
    },
    Display(DisplayCode),
    Error(HardwareErrorCode),
    IccExceptionData(String),
    CardInfo(DecodedFields),
    TradeCancelled,
}

/// Outcome of a `doTrade` card presentment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TradeResultKind {
    None,
    Icc,
    Mcr,
    NfcOnline,
    NfcOffline,
    NotIcc,
    BadSwipe,
    TryAnotherInterface,
    CardNotSupport,
    PlsSeePhone,
    NfcDeclined,
    NoResponse,
    NoUpdateWorkKey,
}

impl TradeResultKind {
    pub fn message(&self) -> &'static str {
        match self {
            TradeResultKind::None => "No card detected",
            TradeResultKind::Icc => "Chip card detected",
            TradeResultKind::Mcr => "Card swiped",
            TradeResultKind::NfcOnline | TradeResultKind::NfcOffline => "Card tapped",
            TradeResultKind::NotIcc => "Card inserted is not a chip card",
            TradeResultKind::BadSwipe => "Bad swipe, please swipe again",
            TradeResultKind::TryAnotherInterface => "Please try another interface",
            TradeResultKind::CardNotSupport => "GPO NOT SUPPORT",
            TradeResultKind::PlsSeePhone => {
                "PLS SEE PHONE, and pls wait for cardholder to confirm, then to try again"
            }
            TradeResultKind::NfcDeclined => "Transaction declined",
            TradeResultKind::NoResponse => "Card no response",
            TradeResultKind::NoUpdateWorkKey => "Work key not updated",
        }
    }
}

/// Final EMV kernel result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransactionResultCode {
    Approved,
    Terminated,
    Declined,
    Cancel,
    CapkFail,
    NotIcc,
    SelectAppFail,
    DeviceError,
    TradeLogFull,
    CardNotSupported,
    MissingMandatoryData,
    CardBlockedOrNoEmvApps,
    InvalidIccData,
    Fallback,
    NfcTerminated,
    CardRemoved,
    ContactlessTransactionNotAllow,
    CardBlocked,
    TransTokenInvalid,
    AppBlocked,
}

impl TransactionResultCode {
    /// Failure message; empty for an approval
    pub fn message(&self) -> &'static str {
        match self {
            TransactionResultCode::Approved => "",
            TransactionResultCode::Terminated => "Transaction terminated",
            TransactionResultCode::Declined => "Transaction declined",
            TransactionResultCode::Cancel => "Cancel",
            TransactionResultCode::CapkFail => "Transaction failed: CAPK fail",
            TransactionResultCode::NotIcc => "Card is not a chip card",
            TransactionResultCode::SelectAppFail => "Application selection failed",
            TransactionResultCode::DeviceError => "Device error",
            TransactionResultCode::TradeLogFull => {
                "the trade log has fulled!pls clear the trade log!"
            }
            TransactionResultCode::CardNotSupported => "Card not supported",
            TransactionResultCode::MissingMandatoryData => "Missing mandatory data",
            TransactionResultCode::CardBlockedOrNoEmvApps => "Card blocked or no EMV apps",
            TransactionResultCode::InvalidIccData => "Invalid ICC data",
            TransactionResultCode::Fallback => "trans fallback",
            TransactionResultCode::NfcTerminated => "NFC Terminated",
            TransactionResultCode::CardRemoved => "CARD REMOVED",
            TransactionResultCode::ContactlessTransactionNotAllow => "TRANS NOT ALLOW",
            TransactionResultCode::CardBlocked => "CARD BLOCKED",
            TransactionResultCode::TransTokenInvalid => "TOKEN INVALID",
            TransactionResultCode::AppBlocked => "APP BLOCKED",
        }
    }
}

/// Prompts the reader asks the terminal to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisplayCode {
    ClearDisplayMsg,
    PleaseWait,
    RemoveCard,
    TryAnotherInterface,
    Processing,
    InputPinIng,
    InputOfflinePinOnly,
    InputLastOfflinePin,
    MagToIccTrade,
    CardRemoved,
    TransactionTerminated,
    PleaseTapCardAgain,
    MsrDataReady,
}

impl DisplayCode {
    pub fn message(&self) -> &'static str {
        match self {
            DisplayCode::ClearDisplayMsg => "",
            DisplayCode::PleaseWait => "Please wait...",
            DisplayCode::RemoveCard => "Please remove card",
            DisplayCode::TryAnotherInterface => "Please try another interface",
            DisplayCode::Processing => "Processing...",
            DisplayCode::InputPinIng => "please input pin on pos",
            DisplayCode::InputOfflinePinOnly | DisplayCode::InputLastOfflinePin => {
                "please input offline pin on pos"
            }
            DisplayCode::MagToIccTrade => "please insert chip card on pos",
            DisplayCode::CardRemoved => "card removed",
            DisplayCode::TransactionTerminated => "transaction terminated",
            DisplayCode::PleaseTapCardAgain => "Please tap card again",
            DisplayCode::MsrDataReady => "Swipe data ready",
        }
    }
}

/// Reader error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HardwareErrorCode {
    Timeout,
    MacError,
    CmdTimeout,
    CmdNotAvailable,
    DeviceReset,
    Unknown,
    DeviceBusy,
    InputOutOfRange,
    InputInvalidFormat,
    InputZeroValues,
    InputInvalid,
    CashbackNotSupported,
    CrcError,
    CommError,
    WrDataError,
    EmvAppCfgError,
    EmvCapkCfgError,
    ApduError,
    IccOnlineTimeout,
    AmountOutOfLimit,
    DigitsUnavailable,
    QposMemoryOverflow,
}

impl HardwareErrorCode {
    /// Device error name, as reported to the failure listener
    pub fn name(&self) -> &'static str {
        match self {
            HardwareErrorCode::Timeout => "TIMEOUT",
            HardwareErrorCode::MacError => "MAC_ERROR",
            HardwareErrorCode::CmdTimeout => "CMD_TIMEOUT",
            HardwareErrorCode::CmdNotAvailable => "CMD_NOT_AVAILABLE",
            HardwareErrorCode::DeviceReset => "DEVICE_RESET",
            HardwareErrorCode::Unknown => "UNKNOWN",
            HardwareErrorCode::DeviceBusy => "DEVICE_BUSY",
            HardwareErrorCode::InputOutOfRange => "INPUT_OUT_OF_RANGE",
            HardwareErrorCode::InputInvalidFormat => "INPUT_INVALID_FORMAT",
            HardwareErrorCode::InputZeroValues => "INPUT_ZERO_VALUES",
            HardwareErrorCode::InputInvalid => "INPUT_INVALID",
            HardwareErrorCode::CashbackNotSupported => "CASHBACK_NOT_SUPPORTED",
            HardwareErrorCode::CrcError => "CRC_ERROR",
            HardwareErrorCode::CommError => "COMM_ERROR",
            HardwareErrorCode::WrDataError => "WR_DATA_ERROR",
            HardwareErrorCode::EmvAppCfgError => "EMV_APP_CFG_ERROR",
            HardwareErrorCode::EmvCapkCfgError => "EMV_CAPK_CFG_ERROR",
            HardwareErrorCode::ApduError => "APDU_ERROR",
            HardwareErrorCode::IccOnlineTimeout => "ICC_ONLINE_TIMEOUT",
            HardwareErrorCode::AmountOutOfLimit => "AMOUNT_OUT_OF_LIMIT",
            HardwareErrorCode::DigitsUnavailable => "DIGITS_UNAVAILABLE",
            HardwareErrorCode::QposMemoryOverflow => "QPOS_MEMORY_OVERFLOW",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            HardwareErrorCode::Timeout => "Reader timed out",
            HardwareErrorCode::MacError => "MAC verification failed",
            HardwareErrorCode::CmdTimeout => "Command timed out",
            HardwareErrorCode::CmdNotAvailable => "Command not available",
            HardwareErrorCode::DeviceReset => "Device reset",
            HardwareErrorCode::Unknown => "Unknown error",
            HardwareErrorCode::DeviceBusy => "Device busy",
            HardwareErrorCode::InputOutOfRange => "Input out of range",
            HardwareErrorCode::InputInvalidFormat => "Input has an invalid format",
            HardwareErrorCode::InputZeroValues => "Input is zero",
            HardwareErrorCode::InputInvalid => "Invalid input",
            HardwareErrorCode::CashbackNotSupported => "Cashback not supported",
            HardwareErrorCode::CrcError => "CRC error",
            HardwareErrorCode::CommError => "Communication error",
            HardwareErrorCode::WrDataError => "Write data error",
            HardwareErrorCode::EmvAppCfgError => "EMV application configuration error",
            HardwareErrorCode::EmvCapkCfgError => "EMV CAPK configuration error",
            HardwareErrorCode::ApduError => "APDU error",
            HardwareErrorCode::IccOnlineTimeout => "ICC online processing timed out",
            HardwareErrorCode::AmountOutOfLimit => "Amount out of limit",
            HardwareErrorCode::DigitsUnavailable => "Digits unavailable",
            HardwareErrorCode::QposMemoryOverflow => "Reader memory overflow",
        }
    }
}
