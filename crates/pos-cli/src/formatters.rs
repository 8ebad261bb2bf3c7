//! Rendering of TLV values for terminal output

use clap::ValueEnum;
use pos_common::tags;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatMode {
    /// Values as uppercase hex
    Raw,
    /// Values decoded by field type
    Human,
}

impl FormatMode {
    pub fn description(&self) -> &'static str {
        match self {
            FormatMode::Raw => "Raw",
            FormatMode::Human => "Human-Readable",
        }
    }
}

/// How a tag's value is decoded for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    ResponseCode,
    ExpiryDate,
    Date,
    Amount,
    Currency,
    Pan,
    Track2,
    Blob,
    Binary,
}

fn field_kind(tag: &[u8]) -> FieldKind {
    let is = |known: pos_common::EmvTag| known.0 == tag;

    if is(tags::APPLICATION_LABEL)
        || is(tags::APPLICATION_PREFERRED_NAME)
        || is(tags::CARDHOLDER_NAME)
    {
        FieldKind::Text
    } else if is(tags::AUTHORISATION_RESPONSE_CODE) {
        FieldKind::ResponseCode
    } else if is(tags::APPLICATION_EXPIRATION_DATE) {
        FieldKind::ExpiryDate
    } else if is(tags::TRANSACTION_DATE) {
        FieldKind::Date
    } else if is(tags::AMOUNT_AUTHORISED) || is(tags::AMOUNT_OTHER) {
        FieldKind::Amount
    } else if is(tags::TRANSACTION_CURRENCY_CODE) {
        FieldKind::Currency
    } else if is(tags::APPLICATION_PAN) || is(tags::MASKED_PAN) {
        FieldKind::Pan
    } else if is(tags::TRACK_2_EQUIVALENT_DATA) {
        FieldKind::Track2
    } else if is(tags::ENCRYPTED_ONLINE_MESSAGE)
        || is(tags::ENCRYPTED_ONLINE_DATA)
        || is(tags::ISSUER_APPLICATION_DATA)
    {
        FieldKind::Blob
    } else {
        FieldKind::Binary
    }
}

/// Render `value` for display according to the field `tag` identifies
pub fn format_value(tag: &[u8], value: &[u8], mode: FormatMode) -> String {
    let hex = hex::encode_upper(value);
    if mode == FormatMode::Raw {
        return hex;
    }

    match field_kind(tag) {
        FieldKind::Text => printable(value).map_or(hex, |text| text.trim_end().to_string()),
        FieldKind::ResponseCode => match printable(value) {
            Some(code) => match response_code_label(&code) {
                Some(label) => format!("{code} ({label})"),
                None => code,
            },
            None => hex,
        },
        FieldKind::ExpiryDate if value.len() == 3 => {
            format!("{}/{} (month/year)", &hex[2..4], &hex[0..2])
        }
        FieldKind::Date if value.len() == 3 => {
            format!("20{}-{}-{}", &hex[0..2], &hex[2..4], &hex[4..6])
        }
        // Minor units, BCD
        FieldKind::Amount => match hex.parse::<u64>() {
            Ok(minor) => format!("{}.{:02}", minor / 100, minor % 100),
            Err(_) => hex,
        },
        // ISO 4217 numeric, BCD with a leading zero nibble
        FieldKind::Currency if value.len() == 2 => match hex.parse::<u16>() {
            Ok(numeric) => match currency(numeric) {
                Some((alpha, name)) => format!("{alpha} ({name})"),
                None => format!("Currency Code {numeric}"),
            },
            Err(_) => hex,
        },
        // Odd digit counts carry one F pad nibble
        FieldKind::Pan => hex.strip_suffix('F').map(str::to_string).unwrap_or(hex),
        // D separates PAN and expiry/service data
        FieldKind::Track2 => hex.trim_end_matches('F').replacen('D', " | ", 1),
        FieldKind::Blob if value.len() > 32 => {
            format!("{}... ({} bytes)", &hex[..64], value.len())
        }
        _ => hex,
    }
}

fn printable(value: &[u8]) -> Option<String> {
    std::str::from_utf8(value)
        .ok()
        .filter(|text| !text.chars().any(char::is_control))
        .map(str::to_string)
}

fn response_code_label(code: &str) -> Option<&'static str> {
    match code {
        "00" => Some("Approved"),
        "05" => Some("Do not honour"),
        "51" => Some("Insufficient funds"),
        "54" => Some("Expired card"),
        "55" => Some("Incorrect PIN"),
        _ => None,
    }
}

fn currency(numeric: u16) -> Option<(&'static str, &'static str)> {
    const CURRENCIES: &[(u16, &str, &str)] = &[
        (156, "CNY", "Chinese Yuan"),
        (344, "HKD", "Hong Kong Dollar"),
        (840, "USD", "US Dollar"),
        (978, "EUR", "Euro"),
        (826, "GBP", "Pound Sterling"),
        (124, "CAD", "Canadian Dollar"),
        (392, "JPY", "Japanese Yen"),
    ];
    CURRENCIES
        .iter()
        .find(|(code, _, _)| *code == numeric)
        .map(|(_, alpha, name)| (*alpha, *name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human(tag: &[u8], value: &[u8]) -> String {
        format_value(tag, value, FormatMode::Human)
    }

    #[test]
    fn test_raw_mode_is_hex() {
        assert_eq!(format_value(&[0x8A], b"00", FormatMode::Raw), "3030");
        assert_eq!(format_value(&[0x50], b"VISA", FormatMode::Raw), "56495341");
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(human(&[0x8A], b"00"), "00 (Approved)");
        assert_eq!(human(&[0x8A], b"51"), "51 (Insufficient funds)");
        assert_eq!(human(&[0x8A], b"Z3"), "Z3");
    }

    #[test]
    fn test_amount_and_currency() {
        assert_eq!(human(&[0x9F, 0x02], &[0x00, 0x00, 0x00, 0x00, 0x12, 0x50]), "12.50");
        assert_eq!(human(&[0x5F, 0x2A], &[0x01, 0x56]), "CNY (Chinese Yuan)");
        assert_eq!(human(&[0x5F, 0x2A], &[0x09, 0x99]), "Currency Code 999");
    }

    #[test]
    fn test_card_fields() {
        assert_eq!(human(&[0xC4], &[0x62, 0x10, 0x67, 0xFF, 0x47, 0x4F]), "621067FF474");
        assert_eq!(human(&[0x5F, 0x20], b"SMITH/JOHN  "), "SMITH/JOHN");
        assert_eq!(human(&[0x57], &[0x47, 0x61, 0xD2, 0x81, 0x2F]), "4761 | 2812");
        assert_eq!(human(&[0x5F, 0x24], &[0x28, 0x12, 0x31]), "12/28 (month/year)");
        assert_eq!(human(&[0x9A], &[0x24, 0x03, 0x09]), "2024-03-09");
    }

    #[test]
    fn test_large_blobs_are_truncated() {
        let blob = [0xAB; 40];
        assert_eq!(human(&[0xC0], &blob), format!("{}... (40 bytes)", "AB".repeat(32)));
        assert_eq!(human(&[0xC0], &[0xAB; 4]), "ABABABAB");
    }
}
