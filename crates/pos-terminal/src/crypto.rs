//! ISO 9564 format-4 PIN block construction
//!
//! The reader hands out a per-transaction context (`RandomData`, `PAN`, `AESKey`, ...)
//! through `getEncryptData`. The PIN block is built as:
//!
//! 1. plain block: `4` || PIN length || PIN || `A` padding to 14 nibbles || 16 nibbles of
//!    random data
//! 2. PAN block: PAN length marker || PAN, zero-padded to 32 nibbles
//! 3. `AES(key, AES(key, plain) XOR pan_block)`

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use rand::RngCore;
use thiserror::Error;

use crate::reader::DecodedFields;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

pub const MIN_PIN_LENGTH: usize = 4;
pub const MAX_PIN_LENGTH: usize = 12;

/// Longest PAN the ISO-4 PAN block can carry
pub const MAX_PAN_LENGTH: usize = 19;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinBlockError {
    #[error("PIN must be {MIN_PIN_LENGTH}-{MAX_PIN_LENGTH} digits, got {0} characters")]
    InvalidPinLength(usize),

    #[error("PIN must contain only digits")]
    InvalidPinDigits,

    #[error("invalid PAN: {0}")]
    InvalidPan(String),

    #[error("invalid AES key: {0}")]
    InvalidKey(String),

    #[error("invalid random data: {0}")]
    InvalidRandomData(String),

    #[error("XOR operands must be {BLOCK_SIZE} bytes, got {left} and {right}")]
    BlockSizeMismatch { left: usize, right: usize },
}

/// Per-transaction PIN encryption context reported by the reader
#[derive(Clone, PartialEq, Eq)]
pub struct PinBlockContext {
    pub pan: String,
    pub aes_key: String,
    pub random_data: String,
    pub pin_try_limit: Option<u32>,
    pub is_online_pin: bool,
}

impl std::fmt::Debug for PinBlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinBlockContext")
            .field("pan", &self.pan)
            .field("aes_key", &"<redacted>")
            .field("random_data", &self.random_data)
            .field("pin_try_limit", &self.pin_try_limit)
            .field("is_online_pin", &self.is_online_pin)
            .finish()
    }
}

impl PinBlockContext {
    /// Build the context from `getEncryptData` fields; absent fields are empty
    pub fn from_fields(fields: &DecodedFields) -> Self {
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();
        Self {
            pan: get("PAN"),
            aes_key: get("AESKey"),
            random_data: get("RandomData"),
            pin_try_limit: fields.get("pinTryLimit").and_then(|v| v.trim().parse().ok()),
            is_online_pin: fields
                .get("isOnlinePin")
                .is_some_and(|v| matches!(v.trim(), "true" | "1" | "TRUE" | "True")),
        }
    }
}

/// Plain ISO-4 PIN field: control nibble, length, PIN, `A` fill, then random data
pub fn plain_pin_field(pin: &str, random_data: &str) -> Result<String, PinBlockError> {
    if !(MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&pin.len()) {
        return Err(PinBlockError::InvalidPinLength(pin.len()));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(PinBlockError::InvalidPinDigits);
    }
    let nonce = random_data.get(..BLOCK_SIZE).ok_or_else(|| {
        PinBlockError::InvalidRandomData(format!(
            "need at least {BLOCK_SIZE} hex characters, got {}",
            random_data.len()
        ))
    })?;
    if !nonce.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PinBlockError::InvalidRandomData("not hex".to_string()));
    }

    let mut field = format!("4{:X}{}", pin.len(), pin);
    field.extend(std::iter::repeat('A').take(14 - pin.len()));
    field.push_str(&nonce.to_ascii_uppercase());
    Ok(field)
}

/// ISO-4 PAN field: length marker, PAN, zero fill to 32 nibbles
pub fn pan_field(pan: &str) -> Result<String, PinBlockError> {
    if pan.is_empty() || pan.len() > MAX_PAN_LENGTH {
        return Err(PinBlockError::InvalidPan(format!(
            "length {} outside 1-{MAX_PAN_LENGTH}",
            pan.len()
        )));
    }
    if !pan.chars().all(|c| c.is_ascii_digit()) {
        return Err(PinBlockError::InvalidPan("must contain only digits".to_string()));
    }

    let mut field = if pan.len() < 12 {
        format!("0{}{}", "0".repeat(12 - pan.len()), pan)
    } else {
        format!("{}{}", pan.len() - 12, pan)
    };
    field.extend(std::iter::repeat('0').take(2 * BLOCK_SIZE - field.len()));
    Ok(field)
}

/// XOR two 16-byte blocks
pub fn xor16(left: &[u8], right: &[u8]) -> Result<[u8; BLOCK_SIZE], PinBlockError> {
    if left.len() != BLOCK_SIZE || right.len() != BLOCK_SIZE {
        return Err(PinBlockError::BlockSizeMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    let mut out = [0u8; BLOCK_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = left[i] ^ right[i];
    }
    Ok(out)
}

/// Encrypt a single block with AES-ECB; the key size selects AES-128/192/256
pub fn aes_encrypt_block(key: &[u8], block: &[u8]) -> Result<[u8; BLOCK_SIZE], PinBlockError> {
    if block.len() != BLOCK_SIZE {
        return Err(PinBlockError::BlockSizeMismatch {
            left: block.len(),
            right: BLOCK_SIZE,
        });
    }

    let mut buffer = GenericArray::clone_from_slice(block);
    match key.len() {
        16 => Aes128::new(GenericArray::from_slice(key)).encrypt_block(&mut buffer),
        24 => Aes192::new(GenericArray::from_slice(key)).encrypt_block(&mut buffer),
        32 => Aes256::new(GenericArray::from_slice(key)).encrypt_block(&mut buffer),
        other => {
            return Err(PinBlockError::InvalidKey(format!(
                "expected 16, 24 or 32 bytes, got {other}"
            )))
        }
    }

    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&buffer);
    Ok(out)
}

/// Build the encrypted ISO-4 PIN block as 32 uppercase hex characters
pub fn build_pin_block(context: &PinBlockContext, pin: &str) -> Result<String, PinBlockError> {
    let key = hex::decode(context.aes_key.trim())
        .map_err(|e| PinBlockError::InvalidKey(e.to_string()))?;
    let plain = plain_pin_field(pin, context.random_data.trim())?;
    let pan = pan_field(context.pan.trim())?;

    // Both fields are validated hex of exactly 32 nibbles at this point
    let plain = hex::decode(&plain).map_err(|e| PinBlockError::InvalidRandomData(e.to_string()))?;
    let pan = hex::decode(&pan).map_err(|e| PinBlockError::InvalidPan(e.to_string()))?;

    let first = aes_encrypt_block(&key, &plain)?;
    let combined = xor16(&first, &pan)?;
    let second = aes_encrypt_block(&key, &combined)?;
    Ok(hex::encode_upper(second))
}

/// Fresh random nonce for PIN blocks, as uppercase hex
pub fn generate_random_data(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode_upper(bytes)
}
