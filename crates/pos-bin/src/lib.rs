//! POS BIN - Card brand classification from PAN prefixes
//!
//! Brands are resolved by walking an ordered table of BIN rules, most specific first,
//! and cards are validated with the Luhn checksum and the brand's expected length.
//!
//! # Example
//! ```
//! use pos_bin::{detect_card_type, is_valid_card, CardBrand};
//!
//! assert_eq!(detect_card_type("4111 1111 1111 1111"), CardBrand::Visa);
//! assert!(is_valid_card("4111111111111111"));
//! ```

use std::fmt;

/// Card brands the terminal can recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardBrand {
    Visa,
    VisaElectron,
    Mastercard,
    Amex,
    Discover,
    UnionPay,
    Jcb,
    DinersClub,
    Maestro,
    ChinaTUnion,
    InstaPayment,
    InterPayment,
    Unknown,
}

impl CardBrand {
    /// Brand name as printed on receipts and sent as the card organisation
    pub fn display_name(&self) -> &'static str {
        match self {
            CardBrand::Visa => "Visa",
            CardBrand::VisaElectron => "Visa Electron",
            CardBrand::Mastercard => "Mastercard",
            CardBrand::Amex => "American Express",
            CardBrand::Discover => "Discover",
            CardBrand::UnionPay => "UnionPay",
            CardBrand::Jcb => "JCB",
            CardBrand::DinersClub => "Diners Club",
            CardBrand::Maestro => "Maestro",
            CardBrand::ChinaTUnion => "China T-Union",
            CardBrand::InstaPayment => "InstaPayment",
            CardBrand::InterPayment => "Interpayment",
            CardBrand::Unknown => "Unknown",
        }
    }

    /// PAN length a valid card of this brand carries
    pub fn expected_length(&self) -> usize {
        match self {
            CardBrand::Amex => 15,
            CardBrand::DinersClub => 14,
            _ => 16,
        }
    }
}

impl fmt::Display for CardBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A single BIN matching rule
#[derive(Debug, Clone, Copy)]
enum BinRule {
    /// PAN starts with the given digits
    Prefix(&'static str),
    /// The first `digits` digits, read as a number, fall in `low..=high`
    Range { digits: usize, low: u32, high: u32 },
}

impl BinRule {
    fn matches(&self, pan: &str) -> bool {
        match *self {
            BinRule::Prefix(prefix) => pan.starts_with(prefix),
            BinRule::Range { digits, low, high } => pan
                .get(..digits)
                .and_then(|bin| bin.parse::<u32>().ok())
                .is_some_and(|bin| (low..=high).contains(&bin)),
        }
    }
}

const fn prefix(digits: &'static str) -> BinRule {
    BinRule::Prefix(digits)
}

const fn range(digits: usize, low: u32, high: u32) -> BinRule {
    BinRule::Range { digits, low, high }
}

/// Ordered BIN table; the first matching entry wins
///
/// Diners Club `54`/`55` never match because Mastercard claims `51`-`55` first.
static BIN_RULES: &[(CardBrand, BinRule)] = &[
    // Visa Electron
    (CardBrand::VisaElectron, prefix("4026")),
    (CardBrand::VisaElectron, prefix("417500")),
    (CardBrand::VisaElectron, prefix("4405")),
    (CardBrand::VisaElectron, prefix("4508")),
    (CardBrand::VisaElectron, prefix("4844")),
    (CardBrand::VisaElectron, prefix("4913")),
    (CardBrand::VisaElectron, prefix("4917")),
    (CardBrand::VisaElectron, prefix("5019")),
    // Maestro
    (CardBrand::Maestro, prefix("5018")),
    (CardBrand::Maestro, prefix("5020")),
    (CardBrand::Maestro, prefix("5038")),
    (CardBrand::Maestro, prefix("5893")),
    (CardBrand::Maestro, prefix("6304")),
    (CardBrand::Maestro, prefix("6759")),
    (CardBrand::Maestro, prefix("6761")),
    (CardBrand::Maestro, prefix("6762")),
    (CardBrand::Maestro, prefix("6763")),
    // Visa
    (CardBrand::Visa, prefix("4")),
    // Mastercard
    (CardBrand::Mastercard, range(2, 51, 55)),
    (CardBrand::Mastercard, range(4, 2221, 2720)),
    // American Express
    (CardBrand::Amex, prefix("34")),
    (CardBrand::Amex, prefix("37")),
    // Discover
    (CardBrand::Discover, prefix("6011")),
    (CardBrand::Discover, prefix("65")),
    (CardBrand::Discover, range(3, 644, 649)),
    (CardBrand::Discover, range(6, 622126, 622925)),
    // UnionPay
    (CardBrand::UnionPay, prefix("62")),
    (CardBrand::UnionPay, prefix("81")),
    // JCB
    (CardBrand::Jcb, range(3, 352, 358)),
    (CardBrand::Jcb, prefix("2131")),
    (CardBrand::Jcb, prefix("1800")),
    // Diners Club
    (CardBrand::DinersClub, range(3, 300, 305)),
    (CardBrand::DinersClub, prefix("309")),
    (CardBrand::DinersClub, prefix("36")),
    (CardBrand::DinersClub, range(2, 38, 39)),
    (CardBrand::DinersClub, range(2, 54, 55)),
    // China T-Union
    (CardBrand::ChinaTUnion, prefix("31")),
    // InstaPayment
    (CardBrand::InstaPayment, range(3, 637, 639)),
    // InterPayment
    (CardBrand::InterPayment, prefix("636")),
];

fn clean(pan: &str) -> String {
    pan.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Detect the card brand from the leading digits of a PAN
///
/// Whitespace is ignored. PANs with fewer than six characters are [`CardBrand::Unknown`].
pub fn detect_card_type(pan: &str) -> CardBrand {
    let pan = clean(pan);
    if pan.len() < 6 {
        return CardBrand::Unknown;
    }

    BIN_RULES
        .iter()
        .find(|(_, rule)| rule.matches(&pan))
        .map(|(brand, _)| *brand)
        .unwrap_or(CardBrand::Unknown)
}

/// Luhn checksum over a PAN of at least 12 digits (whitespace ignored)
///
/// Every second digit from the right is doubled, with 9 subtracted when the result
/// exceeds 9. The PAN is valid when the digit sum is a multiple of 10.
pub fn is_valid_luhn(pan: &str) -> bool {
    let pan = clean(pan);
    if pan.len() < 12 {
        return false;
    }

    let mut sum = 0u32;
    for (i, c) in pan.chars().rev().enumerate() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}

/// Full card validation: known brand, expected length and Luhn checksum
pub fn is_valid_card(pan: &str) -> bool {
    let pan = clean(pan);
    if pan.is_empty() || !pan.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let brand = detect_card_type(&pan);
    brand != CardBrand::Unknown && pan.len() == brand.expected_length() && is_valid_luhn(&pan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_brands() {
        assert_eq!(detect_card_type("4111111111111111"), CardBrand::Visa);
        assert_eq!(detect_card_type("5500000000000000"), CardBrand::Mastercard);
        assert_eq!(detect_card_type("340000000000009"), CardBrand::Amex);
        assert_eq!(detect_card_type("6011000000000000"), CardBrand::Discover);
    }

    #[test]
    fn test_specific_lists_win_over_broad_prefixes() {
        assert_eq!(detect_card_type("4026000000000002"), CardBrand::VisaElectron);
        assert_eq!(detect_card_type("4175001234567890"), CardBrand::VisaElectron);
        assert_eq!(detect_card_type("4175011234567890"), CardBrand::Visa);
        assert_eq!(detect_card_type("5019123456789012"), CardBrand::VisaElectron);
        assert_eq!(detect_card_type("6759123456789012"), CardBrand::Maestro);
        assert_eq!(detect_card_type("5018123456789012"), CardBrand::Maestro);
    }

    #[test]
    fn test_mastercard_two_series() {
        assert_eq!(detect_card_type("2221000000000009"), CardBrand::Mastercard);
        assert_eq!(detect_card_type("2720990000000000"), CardBrand::Mastercard);
        assert_eq!(detect_card_type("2721000000000000"), CardBrand::Unknown);
    }

    #[test]
    fn test_discover_and_unionpay_split() {
        assert_eq!(detect_card_type("6221260000000000"), CardBrand::Discover);
        assert_eq!(detect_card_type("6229250000000000"), CardBrand::Discover);
        assert_eq!(detect_card_type("6229260000000000"), CardBrand::UnionPay);
        assert_eq!(detect_card_type("6212345678901234"), CardBrand::UnionPay);
        assert_eq!(detect_card_type("6450000000000000"), CardBrand::Discover);
        assert_eq!(detect_card_type("8171999927660000"), CardBrand::UnionPay);
    }

    #[test]
    fn test_remaining_brands() {
        assert_eq!(detect_card_type("3530111333300000"), CardBrand::Jcb);
        assert_eq!(detect_card_type("213100000000000"), CardBrand::Jcb);
        assert_eq!(detect_card_type("180000000000000"), CardBrand::Jcb);
        assert_eq!(detect_card_type("30569309025904"), CardBrand::DinersClub);
        assert_eq!(detect_card_type("38520000023237"), CardBrand::DinersClub);
        assert_eq!(detect_card_type("3112345678901234"), CardBrand::ChinaTUnion);
        assert_eq!(detect_card_type("6380000000000000"), CardBrand::InstaPayment);
        assert_eq!(detect_card_type("6360000000000000"), CardBrand::InterPayment);
        assert_eq!(detect_card_type("9999990000000000"), CardBrand::Unknown);
    }

    #[test]
    fn test_short_or_spaced_input() {
        assert_eq!(detect_card_type("41111"), CardBrand::Unknown);
        assert_eq!(detect_card_type(""), CardBrand::Unknown);
        assert_eq!(detect_card_type("4111 1111 1111 1111"), CardBrand::Visa);
    }

    #[test]
    fn test_luhn() {
        assert!(is_valid_luhn("4532015112830366"));
        assert!(!is_valid_luhn("4532015112830367"));
        assert!(!is_valid_luhn("42424242424"));
        assert!(!is_valid_luhn("4532a15112830366"));
    }

    #[test]
    fn test_is_valid_card() {
        assert!(is_valid_card("4111111111111111"));
        assert!(is_valid_card("378282246310005"));
        assert!(is_valid_card("30569309025904"));
        // wrong length for Amex
        assert!(!is_valid_card("3782822463100005"));
        assert!(!is_valid_card("4111111111111112"));
        assert!(!is_valid_card("9999999999999995"));
    }

    #[test]
    fn test_display_and_expected_length() {
        assert_eq!(CardBrand::Amex.to_string(), "American Express");
        assert_eq!(CardBrand::Amex.expected_length(), 15);
        assert_eq!(CardBrand::DinersClub.expected_length(), 14);
        assert_eq!(CardBrand::UnionPay.expected_length(), 16);
    }
}
