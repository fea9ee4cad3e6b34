//! Keyed, format-preserving transform for exposing identifiers.
//!
//! Each character is classified as a digit, lowercase or uppercase ASCII
//! letter and permuted within its own alphabet; every other character passes
//! through unchanged. The permutation is a fixed number of unbalanced Feistel
//! rounds whose round function is HMAC-SHA256 over the remaining positions,
//! so the output has exactly the length and character-class layout of the
//! input and decoding needs nothing but the key.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CanonicalId, KernelError};

type HmacSha256 = Hmac<Sha256>;

pub const MIN_KEY_LEN: usize = 16;
const MAX_INPUT_LEN: usize = 512;
const ROUNDS: u8 = 8;
const DOMAIN_TAG: &[u8] = b"precompute.codec.v1";
const POSITION_MARKER: u8 = 0xFF;

/// Secret key material. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CodecKey {
    bytes: Vec<u8>,
}

impl CodecKey {
    /// # Errors
    /// Returns [`KernelError::Validation`] for keys shorter than [`MIN_KEY_LEN`].
    pub fn new(bytes: Vec<u8>) -> Result<Self, KernelError> {
        if bytes.len() < MIN_KEY_LEN {
            return Err(KernelError::Validation(format!(
                "codec key must be at least {MIN_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for malformed hex or short keys.
    pub fn from_hex(value: &str) -> Result<Self, KernelError> {
        let bytes = hex::decode(value.trim())
            .map_err(|err| KernelError::Validation(format!("codec key is not valid hex: {err}")))?;
        Self::new(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Debug for CodecKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecKey").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CharClass {
    Digit,
    Lower,
    Upper,
}

impl CharClass {
    fn of(c: char) -> Option<(Self, u8)> {
        let byte = u8::try_from(c).ok()?;
        match byte {
            b'0'..=b'9' => Some((Self::Digit, byte - b'0')),
            b'a'..=b'z' => Some((Self::Lower, byte - b'a')),
            b'A'..=b'Z' => Some((Self::Upper, byte - b'A')),
            _ => None,
        }
    }

    fn radix(self) -> u8 {
        match self {
            Self::Digit => 10,
            Self::Lower | Self::Upper => 26,
        }
    }

    fn to_char(self, value: u8) -> char {
        let base = match self {
            Self::Digit => b'0',
            Self::Lower => b'a',
            Self::Upper => b'A',
        };
        char::from(base + value)
    }

    fn tag(self) -> u8 {
        match self {
            Self::Digit => b'd',
            Self::Lower => b'l',
            Self::Upper => b'u',
        }
    }
}

enum Slot {
    Classed(CharClass),
    Literal(char),
}

struct Shape {
    slots: Vec<Slot>,
    classes: Vec<CharClass>,
    values: Vec<u8>,
}

impl Shape {
    fn parse(input: &str) -> Result<Self, KernelError> {
        if input.is_empty() {
            return Err(KernelError::Validation("identifier must not be empty".to_string()));
        }
        if input.len() > MAX_INPUT_LEN {
            return Err(KernelError::Validation(format!(
                "identifier exceeds {MAX_INPUT_LEN} bytes"
            )));
        }
        let mut shape = Self { slots: Vec::new(), classes: Vec::new(), values: Vec::new() };
        for c in input.chars() {
            match CharClass::of(c) {
                Some((class, value)) => {
                    shape.slots.push(Slot::Classed(class));
                    shape.classes.push(class);
                    shape.values.push(value);
                }
                None => shape.slots.push(Slot::Literal(c)),
            }
        }
        Ok(shape)
    }

    fn signature(&self) -> Vec<u8> {
        let mut signature = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot {
                Slot::Classed(class) => signature.push(class.tag()),
                Slot::Literal(c) => {
                    let mut buf = [0_u8; 4];
                    signature.push(b'=');
                    signature.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        signature
    }

    fn render(&self) -> String {
        let mut values = self.values.iter().zip(&self.classes);
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Literal(c) => *c,
                Slot::Classed(_) => values
                    .next()
                    .map_or('?', |(value, class)| class.to_char(*value)),
            })
            .collect()
    }
}

struct RoundFunction {
    keyed: HmacSha256,
}

impl RoundFunction {
    fn new(key: &CodecKey, shape: &Shape) -> Result<Self, KernelError> {
        let mut keyed = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|err| KernelError::Validation(format!("failed to initialize codec key: {err}")))?;
        keyed.update(DOMAIN_TAG);
        keyed.update(&shape.signature());
        Ok(Self { keyed })
    }

    fn offset(&self, round: u8, position: usize, values: &[u8], radix: u8) -> u8 {
        let mut mac = self.keyed.clone();
        mac.update(&[round]);
        mac.update(&u32::try_from(position).unwrap_or(u32::MAX).to_be_bytes());
        for (index, value) in values.iter().enumerate() {
            mac.update(&[if index == position { POSITION_MARKER } else { *value }]);
        }
        let digest = mac.finalize().into_bytes();
        let mut head = [0_u8; 8];
        head.copy_from_slice(&digest[..8]);
        let reduced = u64::from_be_bytes(head) % u64::from(radix);
        u8::try_from(reduced).unwrap_or(0)
    }
}

/// Encode `input` under `key`, preserving its length and character classes.
///
/// # Errors
/// Returns [`KernelError::Validation`] for empty or oversized input.
pub fn encode_with_key(input: &str, key: &CodecKey) -> Result<String, KernelError> {
    let mut shape = Shape::parse(input)?;
    let round_fn = RoundFunction::new(key, &shape)?;
    for round in 0..ROUNDS {
        for position in 0..shape.values.len() {
            let radix = shape.classes[position].radix();
            let offset = round_fn.offset(round, position, &shape.values, radix);
            shape.values[position] = (shape.values[position] + offset) % radix;
        }
    }
    Ok(shape.render())
}

/// Inverse of [`encode_with_key`] for the same key.
///
/// # Errors
/// Returns [`KernelError::Validation`] for empty or oversized input.
pub fn decode_with_key(token: &str, key: &CodecKey) -> Result<String, KernelError> {
    let mut shape = Shape::parse(token)?;
    let round_fn = RoundFunction::new(key, &shape)?;
    for round in (0..ROUNDS).rev() {
        for position in (0..shape.values.len()).rev() {
            let radix = shape.classes[position].radix();
            let offset = round_fn.offset(round, position, &shape.values, radix);
            shape.values[position] = (shape.values[position] + radix - offset) % radix;
        }
    }
    Ok(shape.render())
}

/// Source of codec key material, typically backed by a key-management service.
pub trait KeyProvider: Send + Sync {
    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] when the key cannot be obtained.
    fn decryption_key(&self, key_id: &str) -> Result<CodecKey, KernelError>;
}

/// In-memory key table, for tests and single-key deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    keys: BTreeMap<String, CodecKey>,
}

impl StaticKeyProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, key_id: impl Into<String>, key: CodecKey) -> Self {
        self.keys.insert(key_id.into(), key);
        self
    }
}

impl KeyProvider for StaticKeyProvider {
    fn decryption_key(&self, key_id: &str) -> Result<CodecKey, KernelError> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| KernelError::KeyUnavailable(key_id.to_string()))
    }
}

/// Codec bound to one key id. Fails closed when the key cannot be fetched.
#[derive(Clone)]
pub struct IdentifierCodec {
    provider: Arc<dyn KeyProvider>,
    key_id: String,
}

impl Debug for IdentifierCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierCodec").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

impl IdentifierCodec {
    #[must_use]
    pub fn new(provider: Arc<dyn KeyProvider>, key_id: impl Into<String>) -> Self {
        Self { provider, key_id: key_id.into() }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] or [`KernelError::Validation`].
    pub fn encode(&self, identifier: &str) -> Result<String, KernelError> {
        let key = self.provider.decryption_key(&self.key_id)?;
        encode_with_key(identifier, &key)
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] or [`KernelError::Validation`].
    pub fn decode(&self, token: &str) -> Result<String, KernelError> {
        let key = self.provider.decryption_key(&self.key_id)?;
        decode_with_key(token, &key)
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] when the key cannot be fetched.
    pub fn encode_canonical(&self, canonical_id: CanonicalId) -> Result<String, KernelError> {
        self.encode(&canonical_id.to_string())
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`], or [`KernelError::Validation`] when the
    /// decoded token is not a canonical id.
    pub fn decode_canonical(&self, token: &str) -> Result<CanonicalId, KernelError> {
        self.decode(token)?.parse()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(byte: u8) -> CodecKey {
        CodecKey::new(vec![byte; 32]).unwrap_or_else(|err| panic!("test key rejected: {err}"))
    }

    fn same_shape(a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a.chars().zip(b.chars()).all(|(x, y)| match (CharClass::of(x), CharClass::of(y)) {
                (Some((cx, _)), Some((cy, _))) => cx == cy,
                (None, None) => x == y,
                _ => false,
            })
    }

    #[test]
    fn numeric_ids_stay_numeric() -> Result<(), KernelError> {
        let token = encode_with_key("0012345678", &key(7))?;
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(token, "0012345678");
        assert_eq!(decode_with_key(&token, &key(7))?, "0012345678");
        Ok(())
    }

    #[test]
    fn canonical_ids_round_trip_through_the_codec() -> Result<(), KernelError> {
        let codec = IdentifierCodec::new(
            Arc::new(StaticKeyProvider::new().with_key("primary", key(3))),
            "primary",
        );
        let id = CanonicalId::new();
        let token = codec.encode_canonical(id)?;
        assert!(same_shape(&id.to_string(), &token));
        assert_eq!(codec.decode_canonical(&token)?, id);
        Ok(())
    }

    #[test]
    fn different_keys_give_different_tokens() -> Result<(), KernelError> {
        let input = "repo-42/Team7";
        let a = encode_with_key(input, &key(1))?;
        let b = encode_with_key(input, &key(2))?;
        assert_ne!(a, b);
        assert!(same_shape(input, &a));
        Ok(())
    }

    #[test]
    fn missing_key_fails_closed() {
        let codec = IdentifierCodec::new(Arc::new(StaticKeyProvider::new()), "rotated-out");
        assert_eq!(
            codec.encode("12345"),
            Err(KernelError::KeyUnavailable("rotated-out".to_string()))
        );
        assert!(codec.decode("12345").is_err());
    }

    #[test]
    fn short_keys_and_empty_input_are_rejected() {
        assert!(CodecKey::new(vec![0; MIN_KEY_LEN - 1]).is_err());
        assert!(CodecKey::from_hex("zz").is_err());
        assert!(matches!(encode_with_key("", &key(1)), Err(KernelError::Validation(_))));
    }

    #[test]
    fn literal_only_input_passes_through() -> Result<(), KernelError> {
        assert_eq!(encode_with_key("--/--", &key(9))?, "--/--");
        Ok(())
    }

    #[test]
    fn debug_output_does_not_leak_key_material() {
        let rendered = format!("{:?}", key(0xAB));
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("len"));
    }

    proptest! {
        #[test]
        fn property_round_trip_preserves_shape(
            input in "[A-Za-z0-9_.:/-]{1,40}",
            seed in any::<u8>(),
        ) {
            let key = key(seed);
            let token = encode_with_key(&input, &key);
            prop_assert!(token.is_ok());
            let token = token.unwrap_or_default();
            prop_assert!(same_shape(&input, &token));
            prop_assert_eq!(decode_with_key(&token, &key), Ok(input));
        }
    }
}
