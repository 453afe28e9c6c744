//! Utility module
//!
//! Hex helpers for logging raw frames and writing fixtures.

/// Formats bytes as a contiguous lowercase hex string
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// Parses a hex string, ignoring whitespace; None on odd length or bad digits
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_conversion() {
        let bytes = from_hex("0a004000e413c735b0b5").unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[4], 0xe4);
        assert_eq!(to_hex(&bytes), "0a004000e413c735b0b5");
        assert_eq!(from_hex("07 00 40 00"), Some(vec![0x07, 0x00, 0x40, 0x00]));
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }
}
