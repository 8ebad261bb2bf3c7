//! Run a full transaction against the simulated reader and print every event

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use pos_terminal::{
    ConnectionEvent, ConnectionListener, PaymentResult, Scenario, SimulatedCard, SimulatedPin,
    SimulatedReader, StaticAuthorizer, StaticDecision, TerminalConfig, TradeResultKind,
    TransactionCoordinator, TransactionEvent, TransactionListener,
};
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

const SIMULATED_ADDRESS: &str = "SIM:00:00:00:00:01";

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CardKind {
    /// Chip card inserted
    Icc,
    /// Magnetic stripe swiped
    Mcr,
    /// Contactless tap
    Nfc,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// How the card is presented
    #[arg(long, value_enum, default_value_t = CardKind::Icc)]
    card: CardKind,

    /// Transaction amount
    #[arg(long, default_value = "1000")]
    amount: String,

    /// Card number on the simulated card
    #[arg(long, default_value = "4761739001010010")]
    pan: String,

    /// Number of EMV applications on the chip
    #[arg(long, default_value_t = 1)]
    apps: usize,

    /// PIN typed on the terminal keypad; without it the PIN request is bypassed
    #[arg(long)]
    pin: Option<String>,

    /// Issuer declines with response code 51
    #[arg(long, conflicts_with = "network_failure")]
    decline: bool,

    /// Issuer host is unreachable
    #[arg(long)]
    network_failure: bool,

    /// Terminal settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

pub async fn cmd_simulate(args: SimulateArgs) {
    let config = match &args.config {
        Some(path) => match TerminalConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load terminal settings: {}", err);
                return;
            }
        },
        None => TerminalConfig::default(),
    };

    let scenario = Scenario {
        card: match args.card {
            CardKind::Icc => SimulatedCard::Icc,
            CardKind::Mcr => SimulatedCard::Mcr,
            CardKind::Nfc => SimulatedCard::Nfc,
        },
        pan: args.pan.clone(),
        emv_apps: (1..=args.apps.max(1))
            .map(|n| format!("SIMULATED APP {}", n))
            .collect(),
        pin: if args.pin.is_some() {
            SimulatedPin::Keypad
        } else {
            SimulatedPin::Online
        },
        ..Default::default()
    };
    let decision = if args.decline {
        StaticDecision::Decline("51".to_string())
    } else if args.network_failure {
        StaticDecision::NetworkFailure
    } else {
        StaticDecision::Approve
    };

    let reader = Arc::new(SimulatedReader::new(scenario));
    let authorizer = Arc::new(StaticAuthorizer::new(decision));
    let coordinator = TransactionCoordinator::new(reader, authorizer, config);

    let connection_listener: Arc<dyn ConnectionListener> =
        Arc::new(|event: &ConnectionEvent| println!("[connection] {:?}", event));
    coordinator.register_connection_listener(connection_listener);

    let (tx, mut rx) = unbounded_channel();
    let listener: Arc<dyn TransactionListener> = Arc::new(move |event: &TransactionEvent| {
        let _ = tx.send(event.clone());
    });
    coordinator.register_transaction_listener(listener);

    if let Err(err) = coordinator.connect(SIMULATED_ADDRESS).await {
        eprintln!("Failed to connect to simulated reader: {}", err);
        return;
    }
    println!(
        "Terminal ID: {}\n",
        coordinator.terminal_id().unwrap_or_else(|| "unknown".to_string())
    );

    if let Err(err) = coordinator.start_transaction(&args.amount, None).await {
        eprintln!("Failed to start transaction: {}", err);
        return;
    }

    while let Some(event) = rx.recv().await {
        print_event(&event);

        let step = match &event {
            TransactionEvent::SelectEmvApp(_) => coordinator.select_emv_app(0),
            TransactionEvent::PinKeypadRequested => match &args.pin {
                Some(pin) => coordinator.submit_pin(pin),
                None => coordinator.cancel_pin(),
            },
            TransactionEvent::PinRequested { .. } => match &args.pin {
                Some(pin) => coordinator.submit_pin(pin),
                None => coordinator.bypass_pin(),
            },
            TransactionEvent::TransactionCompleted(result) if !is_chip(result) => {
                authorize(&coordinator, result).await;
                break;
            }
            TransactionEvent::TransactionResult(result) => {
                print_result(result);
                break;
            }
            TransactionEvent::TransactionFailed { .. } => break,
            _ => Ok(()),
        };

        if let Err(err) = step {
            eprintln!("Command rejected: {}", err);
            break;
        }
    }

    if let Err(err) = coordinator.disconnect() {
        debug!(error = %err, "Disconnect after simulation");
    }
}

fn is_chip(result: &PaymentResult) -> bool {
    result.presentment == Some(TradeResultKind::Icc)
}

async fn authorize(coordinator: &TransactionCoordinator, result: &PaymentResult) {
    print_result(result);
    match coordinator.authorize_completed(result).await {
        Ok(response) => println!(
            "\nAuthorization: {} ({})",
            response.response_code(),
            response.message
        ),
        Err(err) => eprintln!("\nAuthorization failed: {}", err),
    }
}

fn print_result(result: &PaymentResult) {
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("\n{}", json),
        Err(_) => println!("\n{}", result.describe()),
    }
}

fn print_event(event: &TransactionEvent) {
    match event {
        TransactionEvent::SelectEmvApp(apps) => {
            println!("[{}] {} application(s):", event.name(), apps.len());
            for (i, app) in apps.iter().enumerate() {
                println!("  {}. {}", i + 1, app);
            }
        }
        TransactionEvent::OnlineProcess { tlv } => println!("[{}] {}", event.name(), tlv),
        TransactionEvent::Display { message, .. } => println!("[{}] {}", event.name(), message),
        TransactionEvent::PinRequested { offline, tries } => println!(
            "[{}] {} PIN, {} tries left",
            event.name(),
            if *offline { "offline" } else { "online" },
            tries
        ),
        TransactionEvent::TransactionCompleted(result)
        | TransactionEvent::TransactionResult(result) => {
            println!("[{}] {:?}", event.name(), result.status)
        }
        TransactionEvent::TransactionFailed { message, raw } => match raw {
            Some(raw) => println!("[{}] {} ({})", event.name(), message, raw),
            None => println!("[{}] {}", event.name(), message),
        },
        _ => println!("[{}]", event.name()),
    }
}
