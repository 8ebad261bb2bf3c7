//! POS Terminal - Payment transaction engine
//!
//! This crate drives a card reader through a payment: connecting, starting a trade,
//! chip application selection, PIN entry and online authorization with the issuer.
//! Reader events are fanned out to registered listeners in the order the reader
//! emitted them.

pub mod authorization;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod events;
pub mod listener;
pub mod reader;
pub mod result;
pub mod simulator;

pub use authorization::{
    AuthorizationError, AuthorizationRequest, AuthorizationResponse, IssuerAuthorizer,
    StaticAuthorizer, StaticDecision,
};
pub use config::TerminalConfig;
pub use coordinator::{PinMode, TransactionCoordinator, TransactionState};
pub use crypto::{build_pin_block, PinBlockContext, PinBlockError};
pub use error::{Result, TerminalError};
pub use events::{DisplayCode, HardwareErrorCode, ReaderEvent, TradeResultKind, TransactionResultCode};
pub use listener::{
    ConnectionEvent, ConnectionListener, ListenerId, ListenerRegistry, TransactionEvent,
    TransactionListener,
};
pub use reader::{CardReader, CardTradeMode, ConnectionState, DecodedFields, EventSender, TransactionType};
pub use result::{CardData, PaymentResult, PaymentResultBuilder, TransactionStatus};
pub use simulator::{Scenario, SimulatedCard, SimulatedPin, SimulatedReader};
