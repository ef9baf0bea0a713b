//! Per-node write sequence tokens.
//!
//! A token is a length-prefixed base-62 number over the ASCII-ordered
//! alphabet `0-9A-Za-z`: one header character holding the digit count,
//! then the digits without leading zeros. Comparing two tokens as bytes
//! therefore compares them numerically, whatever their magnitude.

use serde::{Deserialize, Serialize};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Largest digit count representable by the single header character
const MAX_DIGITS: usize = ALPHABET.len() - 1;

fn digit_value(c: u8) -> Option<usize> {
    ALPHABET.iter().position(|&a| a == c)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sequence(String);

impl Sequence {
    /// The first token a node ever issues
    pub fn first() -> Self {
        Sequence("11".to_string())
    }

    /// The token following `previous`, or the first token when there is none.
    pub fn next_after(previous: Option<&Sequence>) -> Self {
        match previous {
            Some(seq) => seq.next(),
            None => Self::first(),
        }
    }

    /// Strictly greater successor of this token.
    pub fn next(&self) -> Self {
        let mut digits: Vec<u8> = self.0.as_bytes()[1..].to_vec();

        let mut i = digits.len();
        loop {
            if i == 0 {
                // every digit carried over: grow by one digit, e.g. "zz" -> "100"
                let len = digits.len() + 1;
                assert!(len <= MAX_DIGITS, "sequence space exhausted");
                digits = std::iter::once(ALPHABET[1])
                    .chain(std::iter::repeat(ALPHABET[0]).take(len - 1))
                    .collect();
                break;
            }
            i -= 1;
            let value = digit_value(digits[i]).unwrap_or(0);
            if value + 1 < ALPHABET.len() {
                digits[i] = ALPHABET[value + 1];
                break;
            }
            digits[i] = ALPHABET[0];
        }

        let mut token = String::with_capacity(digits.len() + 1);
        token.push(ALPHABET[digits.len()] as char);
        token.push_str(std::str::from_utf8(&digits).unwrap_or_default());
        Sequence(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(token: &str) -> Option<Self> {
        let bytes = token.as_bytes();
        let (&header, digits) = bytes.split_first()?;
        let len = digit_value(header)?;
        if len == 0 || len != digits.len() || digits[0] == ALPHABET[0] {
            return None;
        }
        if digits.iter().any(|&d| digit_value(d).is_none()) {
            return None;
        }
        Some(Sequence(token.to_string()))
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Sequence {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Sequence::parse(&value).ok_or_else(|| format!("invalid sequence token: {:?}", value))
    }
}

impl From<Sequence> for String {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}
