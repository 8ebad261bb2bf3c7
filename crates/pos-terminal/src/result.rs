//! Transaction result aggregation
//!
//! The reader reports card and track data piecemeal across several events. A
//! [`PaymentResultBuilder`] collects those fields for the active trade and is turned into
//! an immutable [`PaymentResult`] once the trade reaches a terminal state.

use std::fmt::Write as _;

use serde::Serialize;

use crate::events::TradeResultKind;
use crate::reader::{DecodedFields, TransactionType};

/// Where a successful transaction ended up
///
/// Failed, declined and cancelled trades carry no result; they end with a
/// `TransactionFailed` event instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    /// Card data captured (swipe, tap, or chip batch data)
    Completed,
    /// Approved by the card after online authorization
    Approved,
}

/// Card and track data of one transaction attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardData {
    pub format_id: String,
    pub masked_pan: String,
    pub expiry_date: String,
    pub cardholder_name: String,
    pub service_code: String,
    pub track1_length: String,
    pub track2_length: String,
    pub track3_length: String,
    pub enc_tracks: String,
    pub enc_track1: String,
    pub enc_track2: String,
    pub enc_track3: String,
    pub partial_track: String,
    pub pin_ksn: String,
    pub track_ksn: String,
    pub pin_block: String,
    pub enc_pan: String,
    pub track_random_number: String,
    pub pin_random_number: String,
}

impl CardData {
    /// Reader key and mutable slot for every field the reader may report
    fn slots(&mut self) -> [(&'static str, &mut String); 19] {
        [
            ("formatID", &mut self.format_id),
            ("maskedPAN", &mut self.masked_pan),
            ("expiryDate", &mut self.expiry_date),
            ("cardholderName", &mut self.cardholder_name),
            ("serviceCode", &mut self.service_code),
            ("track1Length", &mut self.track1_length),
            ("track2Length", &mut self.track2_length),
            ("track3Length", &mut self.track3_length),
            ("encTracks", &mut self.enc_tracks),
            ("encTrack1", &mut self.enc_track1),
            ("encTrack2", &mut self.enc_track2),
            ("encTrack3", &mut self.enc_track3),
            ("partialTrack", &mut self.partial_track),
            ("pinKsn", &mut self.pin_ksn),
            ("trackksn", &mut self.track_ksn),
            ("pinBlock", &mut self.pin_block),
            ("encPAN", &mut self.enc_pan),
            ("trackRandomNumber", &mut self.track_random_number),
            ("pinRandomNumber", &mut self.pin_random_number),
        ]
    }
}

/// Finalized outcome of a transaction attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub amount: String,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub presentment: Option<TradeResultKind>,
    #[serde(flatten)]
    pub card: CardData,
    /// Raw batch/reversal TLV, for logging and receipts
    pub tlv: String,
}

impl PaymentResult {
    /// Receipt-style `label: value` lines for the decoded card data
    pub fn describe(&self) -> String {
        let card = &self.card;
        let rows = [
            ("Format ID", &card.format_id),
            ("Masked PAN", &card.masked_pan),
            ("Expiry Date", &card.expiry_date),
            ("Cardholder Name", &card.cardholder_name),
            ("PIN KSN", &card.pin_ksn),
            ("Track KSN", &card.track_ksn),
            ("Service Code", &card.service_code),
            ("Track 1 Length", &card.track1_length),
            ("Track 2 Length", &card.track2_length),
            ("Track 3 Length", &card.track3_length),
            ("Encrypted Tracks", &card.enc_tracks),
            ("Encrypted Track 1", &card.enc_track1),
            ("Encrypted Track 2", &card.enc_track2),
            ("Encrypted Track 3", &card.enc_track3),
            ("Partial Track", &card.partial_track),
            ("PIN Block", &card.pin_block),
        ];

        let mut out = String::new();
        for (label, value) in rows {
            let _ = writeln!(out, "{label}: {value}");
        }
        out
    }
}

/// Accumulates reader fields for the trade in progress
#[derive(Debug, Clone)]
pub struct PaymentResultBuilder {
    amount: String,
    transaction_type: TransactionType,
    presentment: Option<TradeResultKind>,
    card: CardData,
    tlv: String,
}

impl PaymentResultBuilder {
    pub fn new(amount: impl Into<String>, transaction_type: TransactionType) -> Self {
        Self {
            amount: amount.into(),
            transaction_type,
            presentment: None,
            card: CardData::default(),
            tlv: String::new(),
        }
    }

    /// Copy every known reader field present in `fields`; absent keys leave the slot as is
    ///
    /// No validation happens here, values are kept exactly as reported.
    pub fn absorb(&mut self, fields: &DecodedFields) -> &mut Self {
        for (key, slot) in self.card.slots() {
            if let Some(value) = fields.get(key) {
                *slot = value.clone();
            }
        }
        self
    }

    pub fn set_presentment(&mut self, kind: TradeResultKind) -> &mut Self {
        self.presentment = Some(kind);
        self
    }

    pub fn set_tlv(&mut self, tlv: impl Into<String>) -> &mut Self {
        self.tlv = tlv.into();
        self
    }

    pub fn set_masked_pan(&mut self, pan: impl Into<String>) -> &mut Self {
        self.card.masked_pan = pan.into();
        self
    }

    pub fn masked_pan(&self) -> &str {
        &self.card.masked_pan
    }

    pub fn amount(&self) -> &str {
        &self.amount
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    /// Intermediate view of the data collected so far
    pub fn snapshot(&self, status: TransactionStatus) -> PaymentResult {
        self.clone().build(status)
    }

    pub fn build(self, status: TransactionStatus) -> PaymentResult {
        PaymentResult {
            amount: self.amount,
            transaction_type: self.transaction_type,
            status,
            presentment: self.presentment,
            card: self.card,
            tlv: self.tlv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> DecodedFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_absorb_defaults_to_empty() {
        let mut builder = PaymentResultBuilder::new("100", TransactionType::Goods);
        builder.absorb(&fields(&[("maskedPAN", "411111******1111"), ("pinKsn", "FFFF01")]));

        let result = builder.build(TransactionStatus::Completed);
        assert_eq!(result.card.masked_pan, "411111******1111");
        assert_eq!(result.card.pin_ksn, "FFFF01");
        assert_eq!(result.card.expiry_date, "");
        assert_eq!(result.card.enc_track2, "");
        assert_eq!(result.amount, "100");
    }

    #[test]
    fn test_absorb_keeps_previous_values_and_ignores_unknown_keys() {
        let mut builder = PaymentResultBuilder::new("1", TransactionType::Goods);
        builder
            .absorb(&fields(&[("expiryDate", "2512"), ("trackksn", "AA")]))
            .absorb(&fields(&[("formatID", "30"), ("somethingElse", "x")]));

        let result = builder.snapshot(TransactionStatus::Completed);
        assert_eq!(result.card.expiry_date, "2512");
        assert_eq!(result.card.track_ksn, "AA");
        assert_eq!(result.card.format_id, "30");
    }

    #[test]
    fn test_snapshot_leaves_builder_usable() {
        let mut builder = PaymentResultBuilder::new("5", TransactionType::Cash);
        builder.set_tlv("8A023030");
        let snap = builder.snapshot(TransactionStatus::Completed);
        builder.set_presentment(TradeResultKind::Icc);
        let done = builder.build(TransactionStatus::Approved);

        assert_eq!(snap.presentment, None);
        assert_eq!(done.presentment, Some(TradeResultKind::Icc));
        assert_eq!(done.tlv, "8A023030");
        assert_eq!(done.transaction_type, TransactionType::Cash);
    }

    #[test]
    fn test_describe() {
        let mut builder = PaymentResultBuilder::new("5", TransactionType::Goods);
        builder.absorb(&fields(&[("maskedPAN", "6210******4741"), ("serviceCode", "220")]));
        let text = builder.build(TransactionStatus::Completed).describe();
        assert!(text.contains("Masked PAN: 6210******4741\n"));
        assert!(text.contains("Service Code: 220\n"));
        assert!(text.contains("PIN Block: \n"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut builder = PaymentResultBuilder::new("5", TransactionType::Goods);
        builder.absorb(&fields(&[("maskedPAN", "4111")]));
        let json = serde_json::to_value(builder.build(TransactionStatus::Approved)).unwrap();
        assert_eq!(json["maskedPan"], "4111");
        assert_eq!(json["status"], "approved");
        assert_eq!(json["transactionType"], "GOODS");
    }
}
