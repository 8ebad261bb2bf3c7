//! POS Common - TLV codec and EMV tag dictionary shared by the terminal crates

pub mod tlv;

pub use tlv::{
    decode_hex, is_tlv_format, parse, parse_dol, parse_hex, parse_tree, search_tlv, TlvError,
    TlvHeader, TlvNode,
};

/// EMV Tag identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmvTag(pub &'static [u8]);

impl EmvTag {
    pub fn hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

/// Tags read by the terminal during chip, swipe and contactless transactions
pub mod tags {
    use super::EmvTag;

    // Application metadata
    pub const APPLICATION_IDENTIFIER: EmvTag = EmvTag(&[0x4F]);
    pub const APPLICATION_LABEL: EmvTag = EmvTag(&[0x50]);
    pub const APPLICATION_PAN: EmvTag = EmvTag(&[0x5A]);
    pub const APPLICATION_EXPIRATION_DATE: EmvTag = EmvTag(&[0x5F, 0x24]);
    pub const APPLICATION_PAN_SEQUENCE_NUMBER: EmvTag = EmvTag(&[0x5F, 0x34]);
    pub const TERMINAL_AID: EmvTag = EmvTag(&[0x9F, 0x06]);
    pub const APPLICATION_PREFERRED_NAME: EmvTag = EmvTag(&[0x9F, 0x12]);

    // Cardholder data
    pub const CARDHOLDER_NAME: EmvTag = EmvTag(&[0x5F, 0x20]);
    pub const TRACK_2_EQUIVALENT_DATA: EmvTag = EmvTag(&[0x57]);
    pub const SERVICE_CODE: EmvTag = EmvTag(&[0x5F, 0x30]);

    // Transaction data
    pub const AMOUNT_AUTHORISED: EmvTag = EmvTag(&[0x9F, 0x02]);
    pub const AMOUNT_OTHER: EmvTag = EmvTag(&[0x9F, 0x03]);
    pub const TRANSACTION_CURRENCY_CODE: EmvTag = EmvTag(&[0x5F, 0x2A]);
    pub const TRANSACTION_DATE: EmvTag = EmvTag(&[0x9A]);
    pub const TRANSACTION_TYPE: EmvTag = EmvTag(&[0x9C]);
    pub const TERMINAL_VERIFICATION_RESULTS: EmvTag = EmvTag(&[0x95]);
    pub const TERMINAL_COUNTRY_CODE: EmvTag = EmvTag(&[0x9F, 0x1A]);
    pub const CVM_RESULTS: EmvTag = EmvTag(&[0x9F, 0x34]);
    pub const AUTHORISATION_RESPONSE_CODE: EmvTag = EmvTag(&[0x8A]);

    // Cryptogram data
    pub const APPLICATION_CRYPTOGRAM: EmvTag = EmvTag(&[0x9F, 0x26]);
    pub const CRYPTOGRAM_INFORMATION_DATA: EmvTag = EmvTag(&[0x9F, 0x27]);
    pub const APPLICATION_TRANSACTION_COUNTER: EmvTag = EmvTag(&[0x9F, 0x36]);
    pub const ISSUER_APPLICATION_DATA: EmvTag = EmvTag(&[0x9F, 0x10]);
    pub const UNPREDICTABLE_NUMBER: EmvTag = EmvTag(&[0x9F, 0x37]);

    // Reader-proprietary encrypted data
    pub const ENCRYPTED_ONLINE_MESSAGE: EmvTag = EmvTag(&[0xC0]);
    pub const ONLINE_MESSAGE_KSN: EmvTag = EmvTag(&[0xC1]);
    pub const ENCRYPTED_ONLINE_DATA: EmvTag = EmvTag(&[0xC2]);
    pub const MASKED_PAN: EmvTag = EmvTag(&[0xC4]);
    pub const PIN_KSN: EmvTag = EmvTag(&[0xC5]);
    pub const TRACK_KSN: EmvTag = EmvTag(&[0xC6]);
    pub const PIN_BLOCK: EmvTag = EmvTag(&[0xC7]);

    // Templates
    pub const RECORD_TEMPLATE: EmvTag = EmvTag(&[0x70]);
    pub const RESPONSE_MESSAGE_TEMPLATE_FORMAT_2: EmvTag = EmvTag(&[0x77]);
}

/// Get a human-readable name for an EMV tag
pub fn get_tag_name(tag: &[u8]) -> &'static str {
    match tag {
        [0x4F] => "Application Identifier (AID)",
        [0x50] => "Application Label",
        [0x57] => "Track 2 Equivalent Data",
        [0x5A] => "Application PAN",
        [0x5F, 0x20] => "Cardholder Name",
        [0x5F, 0x24] => "Application Expiration Date",
        [0x5F, 0x2A] => "Transaction Currency Code",
        [0x5F, 0x30] => "Service Code",
        [0x5F, 0x34] => "Application PAN Sequence Number",
        [0x70] => "Record Template",
        [0x77] => "Response Message Template Format 2",
        [0x82] => "Application Interchange Profile",
        [0x84] => "Dedicated File Name",
        [0x8A] => "Authorisation Response Code",
        [0x95] => "Terminal Verification Results",
        [0x9A] => "Transaction Date",
        [0x9C] => "Transaction Type",
        [0x9F, 0x02] => "Amount, Authorised",
        [0x9F, 0x03] => "Amount, Other",
        [0x9F, 0x06] => "Application Identifier (Terminal)",
        [0x9F, 0x10] => "Issuer Application Data",
        [0x9F, 0x12] => "Application Preferred Name",
        [0x9F, 0x1A] => "Terminal Country Code",
        [0x9F, 0x21] => "Transaction Time",
        [0x9F, 0x26] => "Application Cryptogram",
        [0x9F, 0x27] => "Cryptogram Information Data",
        [0x9F, 0x33] => "Terminal Capabilities",
        [0x9F, 0x34] => "CVM Results",
        [0x9F, 0x36] => "Application Transaction Counter",
        [0x9F, 0x37] => "Unpredictable Number",
        [0xC0] => "Encrypted Online Message",
        [0xC1] => "Online Message KSN",
        [0xC2] => "Encrypted Online Data",
        [0xC4] => "Masked PAN",
        [0xC5] => "PIN KSN",
        [0xC6] => "Track KSN",
        [0xC7] => "PIN Block",
        _ => "Unknown Tag",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        assert_eq!(get_tag_name(tags::MASKED_PAN.0), "Masked PAN");
        assert_eq!(get_tag_name(&[0x9F, 0x02]), "Amount, Authorised");
        assert_eq!(get_tag_name(&[0xDF, 0x01]), "Unknown Tag");
    }

    #[test]
    fn test_search_by_tag_constant() {
        let nodes = parse(&[0x8A, 0x02, 0x30, 0x30]).unwrap();
        let arc = search_tlv(&nodes, &tags::AUTHORISATION_RESPONSE_CODE.hex()).unwrap();
        assert_eq!(arc.value, b"00".to_vec());
    }
}
