//! Reversible content transforms.
//!
//! An element with a transform holds its content in encoded form on the
//! wire. The cracker decodes the encoded region into a fresh stream and
//! cracks the element against that; generation runs the transform forward
//! with [`Transform::encode`].

use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt::Debug;

/// A reversible byte transform
pub trait Transform: Debug + Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Turns wire bytes into content bytes
    fn decode(&self, data: &[u8]) -> Result<Bytes>;

    /// Turns content bytes into wire bytes
    fn encode(&self, data: &[u8]) -> Result<Bytes>;
}

/// ASCII hexadecimal, two lowercase digits per byte
#[derive(Debug, Clone, Copy, Default)]
pub struct Hex;

impl Transform for Hex {
    fn name(&self) -> &str {
        "hex"
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        if data.len() % 2 != 0 {
            return Err(Error::transform(
                self.name(),
                format!("odd input length {}", data.len()),
            ));
        }

        data.chunks_exact(2)
            .map(|pair| -> Result<u8> { Ok(nibble(pair[0])? << 4 | nibble(pair[1])?) })
            .collect::<Result<Vec<u8>>>()
            .map(Bytes::from)
    }

    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = Vec::with_capacity(data.len() * 2);
        for byte in data {
            out.push(DIGITS[usize::from(byte >> 4)]);
            out.push(DIGITS[usize::from(byte & 0x0F)]);
        }
        Ok(Bytes::from(out))
    }
}

fn nibble(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(Error::transform(
            "hex",
            format!("invalid digit 0x{:02x}", digit),
        )),
    }
}

/// Single-byte XOR mask
#[derive(Debug, Clone, Copy)]
pub struct Xor(pub u8);

impl Transform for Xor {
    fn name(&self) -> &str {
        "xor"
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(data.iter().map(|b| b ^ self.0).collect())
    }

    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        self.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_decode() {
        assert_eq!(&Hex.decode(b"4142ff").unwrap()[..], b"AB\xff");
        assert_eq!(&Hex.decode(b"4A4b").unwrap()[..], b"JK");
        assert_eq!(&Hex.encode(b"AB\xff").unwrap()[..], b"4142ff");
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(matches!(Hex.decode(b"414"), Err(Error::Transform { .. })));
        assert!(Hex.decode(b"zz").unwrap_err().is_recoverable());
    }

    #[test]
    fn test_xor_is_symmetric() {
        let xor = Xor(0x20);
        let encoded = xor.encode(b"abc").unwrap();
        assert_eq!(&encoded[..], b"ABC");
        assert_eq!(&xor.decode(&encoded).unwrap()[..], b"abc");
    }
}
