//! Terminal settings
//!
//! Persisted as camelCase JSON:
//! ```json
//! {
//!   "cardMode": "SWIPE_TAP_INSERT_CARD",
//!   "smartDevice": false,
//!   "currencyCode": 156,
//!   "transactionType": "GOODS",
//!   "connectTimeoutSecs": 30
//! }
//! ```
//! Missing keys take their defaults, so an empty object is a valid file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TerminalError};
use crate::reader::{CardTradeMode, TransactionType};

fn default_currency_code() -> u16 {
    156
}

fn default_transaction_type() -> String {
    TransactionType::Goods.name().to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_device_id_timeout() -> u64 {
    5
}

fn default_trade_timeout() -> u64 {
    60
}

fn default_authorization_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    /// Card-entry mode; `None` picks the default for the device class
    #[serde(default)]
    pub card_mode: Option<CardTradeMode>,
    #[serde(default)]
    pub smart_device: bool,
    #[serde(default = "default_currency_code")]
    pub currency_code: u16,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_device_id_timeout")]
    pub device_id_timeout_secs: u64,
    #[serde(default = "default_trade_timeout")]
    pub trade_timeout_secs: u64,
    #[serde(default = "default_authorization_timeout")]
    pub authorization_timeout_secs: u64,
    /// Answer the reader's time request with the local clock
    #[serde(default = "default_true")]
    pub auto_send_time: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            card_mode: None,
            smart_device: false,
            currency_code: default_currency_code(),
            transaction_type: default_transaction_type(),
            connect_timeout_secs: default_connect_timeout(),
            device_id_timeout_secs: default_device_id_timeout(),
            trade_timeout_secs: default_trade_timeout(),
            authorization_timeout_secs: default_authorization_timeout(),
            auto_send_time: true,
        }
    }
}

impl TerminalConfig {
    /// Load settings from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No terminal settings file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.currency_code == 0 || self.currency_code > 999 {
            return Err(TerminalError::config(format!(
                "currency code {} is not an ISO 4217 numeric code",
                self.currency_code
            )));
        }
        let timeouts = [
            ("connectTimeoutSecs", self.connect_timeout_secs),
            ("deviceIdTimeoutSecs", self.device_id_timeout_secs),
            ("tradeTimeoutSecs", self.trade_timeout_secs),
            ("authorizationTimeoutSecs", self.authorization_timeout_secs),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(TerminalError::config(format!(
                "{key} must be at least one second"
            )));
        }
        Ok(())
    }

    pub fn card_trade_mode(&self) -> CardTradeMode {
        self.card_mode
            .unwrap_or_else(|| CardTradeMode::device_default(self.smart_device))
    }

    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_name(&self.transaction_type)
    }

    /// Currency code as the three-digit string the reader expects
    pub fn currency_code_str(&self) -> String {
        format!("{:03}", self.currency_code)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn device_id_timeout(&self) -> Duration {
        Duration::from_secs(self.device_id_timeout_secs)
    }

    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TerminalConfig::default();
        assert_eq!(config.currency_code, 156);
        assert_eq!(config.transaction_type(), TransactionType::Goods);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.device_id_timeout(), Duration::from_secs(5));
        assert_eq!(config.trade_timeout_secs, 60);
        assert_eq!(config.card_trade_mode(), CardTradeMode::SwipeTapInsertCard);
        assert_eq!(config.currency_code_str(), "156");
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: TerminalConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TerminalConfig::default());
    }

    #[test]
    fn test_camel_case_keys() {
        let json = r#"{"cardMode":"ONLY_INSERT_CARD","currencyCode":840,"transactionType":"REFUND","smartDevice":true}"#;
        let config: TerminalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.card_trade_mode(), CardTradeMode::OnlyInsertCard);
        assert_eq!(config.currency_code_str(), "840");
        assert_eq!(config.transaction_type(), TransactionType::Refund);
    }

    #[test]
    fn test_smart_device_default_mode() {
        let config = TerminalConfig {
            smart_device: true,
            ..Default::default()
        };
        assert_eq!(config.card_trade_mode(), CardTradeMode::SwipeTapInsertCardNotUp);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");

        let config = TerminalConfig {
            currency_code: 978,
            card_mode: Some(CardTradeMode::OnlyTapCard),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = TerminalConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = TerminalConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, TerminalConfig::default());
    }

    #[test]
    fn test_invalid_currency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        std::fs::write(&path, r#"{"currencyCode":0}"#).unwrap();
        assert!(matches!(
            TerminalConfig::load(&path),
            Err(TerminalError::Config(_))
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for key in [
            "connectTimeoutSecs",
            "deviceIdTimeoutSecs",
            "tradeTimeoutSecs",
            "authorizationTimeoutSecs",
        ] {
            let config: TerminalConfig =
                serde_json::from_str(&format!(r#"{{"{key}":0}}"#)).unwrap();
            match config.validate() {
                Err(TerminalError::Config(message)) => assert!(message.contains(key), "{message}"),
                other => panic!("{key}: expected a config error, got {other:?}"),
            }
        }
        assert!(TerminalConfig::default().validate().is_ok());
    }
}
