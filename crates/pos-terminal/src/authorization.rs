//! Online authorization with the card issuer
//!
//! When the chip asks to go online, the terminal sends an [`AuthorizationRequest`] to
//! an [`IssuerAuthorizer`] and feeds the answer back to the card as an authorisation
//! response code TLV (`8A`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use pos_bin::CardBrand;
use pos_common::{parse_hex, search_tlv, tags, TlvError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reader::{DecodedFields, TransactionType};

/// Response code returned to the card when the issuer cannot be reached
pub const DECLINE_RESPONSE_CODE: &str = "05";

/// `8A` TLV carrying [`DECLINE_RESPONSE_CODE`]
pub const NETWORK_FAILURE_TLV: &str = "8A023035";

/// `formatID` whose ICC data carries the PAN in `maskedPAN` rather than tag `C4`
const MASKED_PAN_FORMAT_ID: &str = "32";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("issuer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Payload sent to the issuer host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub device_sn: String,
    pub amount: String,
    pub mask_pan: String,
    pub card_org: String,
    pub transaction_type: String,
    pub pay_type: String,
    pub trans_result: String,
    pub transaction_date: String,
    pub transaction_time: String,
}

impl AuthorizationRequest {
    pub fn new(
        device_sn: &str,
        amount: &str,
        card_number: &str,
        transaction_type: TransactionType,
        at: DateTime<Local>,
    ) -> Self {
        let brand = pos_bin::detect_card_type(card_number);
        Self {
            device_sn: device_sn.to_string(),
            amount: amount.to_string(),
            mask_pan: card_number.to_string(),
            card_org: brand.display_name().to_string(),
            transaction_type: transaction_type.name().to_string(),
            pay_type: "Card".to_string(),
            trans_result: "Paid".to_string(),
            transaction_date: at.format("%Y-%m-%d").to_string(),
            transaction_time: at.format("%H:%M:%S").to_string(),
        }
    }

    pub fn card_brand(&self) -> CardBrand {
        pos_bin::detect_card_type(&self.mask_pan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    pub result_code: String,
    pub message: String,
    pub ok: bool,
}

impl AuthorizationResponse {
    pub fn approved() -> Self {
        Self {
            result_code: "00".to_string(),
            message: "Approved".to_string(),
            ok: true,
        }
    }

    pub fn declined(code: &str, message: &str) -> Self {
        Self {
            result_code: code.to_string(),
            message: message.to_string(),
            ok: false,
        }
    }

    /// Two-character authorisation response code to hand to the card
    ///
    /// An approval without a code means `00`. A decline keeps the issuer's code unless
    /// it is missing, malformed or `00`, in which case the generic decline `05` is used.
    pub fn response_code(&self) -> &str {
        let code = self.result_code.trim();
        let well_formed = code.len() == 2 && code.is_ascii();
        if self.ok {
            if well_formed {
                code
            } else {
                "00"
            }
        } else if well_formed && code != "00" {
            code
        } else {
            DECLINE_RESPONSE_CODE
        }
    }

    pub fn online_result_tlv(&self) -> String {
        online_result_tlv(self.response_code())
    }
}

/// `8A 02 <code>` as hex; the two ASCII code characters become the value bytes
pub fn online_result_tlv(response_code: &str) -> String {
    if response_code.len() != 2 || !response_code.is_ascii() {
        return NETWORK_FAILURE_TLV.to_string();
    }
    format!(
        "{}02{}",
        tags::AUTHORISATION_RESPONSE_CODE.hex(),
        hex::encode_upper(response_code.as_bytes())
    )
}

/// Card number for the authorization request of a chip transaction
///
/// With `formatID` 32 the reader reports the PAN directly in `maskedPAN`. Otherwise it
/// is read from tag `C4` of the online-process TLV, dropping the trailing `F` pad nibble.
pub fn icc_card_number(fields: &DecodedFields, tlv_hex: &str) -> Result<String, TlvError> {
    if fields.get("formatID").map(String::as_str) == Some(MASKED_PAN_FORMAT_ID) {
        return Ok(fields.get("maskedPAN").cloned().unwrap_or_default());
    }

    let nodes = parse_hex(tlv_hex)?;
    let card_number = search_tlv(&nodes, &tags::MASKED_PAN.hex())
        .map(|node| node.value_hex())
        .unwrap_or_default();
    Ok(card_number
        .strip_suffix('F')
        .map(str::to_string)
        .unwrap_or(card_number))
}

/// Issuer host collaborator
#[async_trait]
pub trait IssuerAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResponse, AuthorizationError>;
}

/// What a [`StaticAuthorizer`] answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticDecision {
    Approve,
    Decline(String),
    NetworkFailure,
    /// Never answers; exercises the authorization timeout
    Hang,
}

/// Authorizer with a fixed answer, recording every request it receives
#[derive(Debug)]
pub struct StaticAuthorizer {
    decision: StaticDecision,
    requests: Mutex<Vec<AuthorizationRequest>>,
}

impl StaticAuthorizer {
    pub fn new(decision: StaticDecision) -> Self {
        Self {
            decision,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn approving() -> Self {
        Self::new(StaticDecision::Approve)
    }

    pub fn requests(&self) -> Vec<AuthorizationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl IssuerAuthorizer for StaticAuthorizer {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResponse, AuthorizationError> {
        self.requests.lock().push(request.clone());
        match &self.decision {
            StaticDecision::Approve => Ok(AuthorizationResponse::approved()),
            StaticDecision::Decline(code) => {
                Ok(AuthorizationResponse::declined(code, "Declined by issuer"))
            }
            StaticDecision::NetworkFailure => {
                Err(AuthorizationError::Network("host unreachable".to_string()))
            }
            StaticDecision::Hang => {
                std::future::pending::<()>().await;
                Err(AuthorizationError::Network("unreachable".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_online_result_tlv() {
        assert_eq!(online_result_tlv("00"), "8A023030");
        assert_eq!(online_result_tlv("05"), NETWORK_FAILURE_TLV);
        assert_eq!(online_result_tlv("Z3"), "8A025A33");
        assert_eq!(online_result_tlv("0"), NETWORK_FAILURE_TLV);
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(AuthorizationResponse::approved().response_code(), "00");
        assert_eq!(AuthorizationResponse::declined("51", "").response_code(), "51");
        assert_eq!(AuthorizationResponse::declined("", "").response_code(), "05");
        assert_eq!(AuthorizationResponse::declined("00", "").response_code(), "05");
        let approved_without_code = AuthorizationResponse {
            result_code: String::new(),
            message: String::new(),
            ok: true,
        };
        assert_eq!(approved_without_code.online_result_tlv(), "8A023030");
    }

    #[test]
    fn test_icc_card_number_from_masked_pan() {
        let mut fields = DecodedFields::new();
        fields.insert("formatID".to_string(), "32".to_string());
        fields.insert("maskedPAN".to_string(), "622526XXXXXX5453".to_string());
        // TLV is not consulted, even when unparsable
        assert_eq!(icc_card_number(&fields, "ZZ").unwrap(), "622526XXXXXX5453");
    }

    #[test]
    fn test_icc_card_number_from_c4() {
        let fields = DecodedFields::new();
        let tlv = "9F0607A0000003330101C40A621067FFFFFFFFF0474F";
        assert_eq!(icc_card_number(&fields, tlv).unwrap(), "621067FFFFFFFFF0474");
    }

    #[test]
    fn test_icc_card_number_missing_or_malformed() {
        let fields = DecodedFields::new();
        assert_eq!(icc_card_number(&fields, "9F020100").unwrap(), "");
        assert!(icc_card_number(&fields, "C40A6210").is_err());
    }

    #[test]
    fn test_request_payload() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let request =
            AuthorizationRequest::new("SN01", "12.50", "4111111111111111", TransactionType::Goods, at);
        assert_eq!(request.card_org, "Visa");
        assert_eq!(request.card_brand(), CardBrand::Visa);
        assert_eq!(request.transaction_date, "2024-03-09");
        assert_eq!(request.transaction_time, "14:05:07");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["deviceSn"], "SN01");
        assert_eq!(json["maskPan"], "4111111111111111");
        assert_eq!(json["payType"], "Card");
        assert_eq!(json["transResult"], "Paid");
    }

    #[tokio::test]
    async fn test_static_authorizer_records_requests() {
        let authorizer = StaticAuthorizer::new(StaticDecision::Decline("51".to_string()));
        let request = AuthorizationRequest::new(
            "SN01",
            "1",
            "5500000000000004",
            TransactionType::Goods,
            Local::now(),
        );

        let response = authorizer.authorize(&request).await.unwrap();
        assert!(!response.ok);
        assert_eq!(response.online_result_tlv(), "8A023531");
        assert_eq!(authorizer.requests().len(), 1);
        assert_eq!(authorizer.requests()[0].card_org, "Mastercard");
    }
}
