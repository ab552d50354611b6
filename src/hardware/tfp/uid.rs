//! Base58 UID handling
//!
//! Devices are addressed by a numeric UID on the wire but identified by its base58 string
//! everywhere else. Some devices carry 64 bit UIDs, these are folded into 32 bits the same way
//! the devices do it themselves.

use crate::hardware::{HardwareError, HardwareResult};

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// Encodes a numeric UID as base58
pub fn encode(mut value: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(ALPHABET[(value % 58) as usize]);
        value /= 58;
        if value == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Decodes a base58 UID into its numeric form
pub fn decode(uid: &str) -> HardwareResult<u32> {
    if uid.is_empty() {
        return Err(HardwareError::InvalidUid(uid.into()));
    }
    let mut value: u64 = 0;
    for c in uid.bytes() {
        let digit = ALPHABET
            .iter()
            .position(|a| *a == c)
            .ok_or_else(|| HardwareError::InvalidUid(uid.into()))?;
        value = value
            .checked_mul(58)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| HardwareError::InvalidUid(uid.into()))?;
    }
    if value > u32::MAX as u64 {
        Ok(fold_64bit(value))
    } else {
        Ok(value as u32)
    }
}

fn fold_64bit(value: u64) -> u32 {
    let low = (value & 0xFFFF_FFFF) as u32;
    let high = (value >> 32) as u32;
    (low & 0x0000_0FFF)
        | ((low & 0x0F00_0000) >> 12)
        | ((high & 0x0000_003F) << 16)
        | ((high & 0x000F_0000) << 6)
        | ((high & 0x3F00_0000) << 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(decode("1").unwrap(), 0);
        assert_eq!(decode("2").unwrap(), 1);
        assert_eq!(decode("21").unwrap(), 58);
        assert_eq!(encode(58), "21");
        assert_eq!(encode(0), "1");
    }

    #[test]
    fn test_fixture_uids() {
        for uid in ["Sii", "UmP", "Ukk", "Tfh", "23RC", "27q9", "29aw", "2sTvA3"] {
            let n = decode(uid).unwrap();
            assert_eq!(encode(n), uid);
        }
    }

    #[test]
    fn test_invalid() {
        // 0, O, I and l are not part of the alphabet
        assert!(decode("0ab").is_err());
        assert!(decode("lol").is_err());
        assert!(decode("").is_err());
        assert!(decode("zzzzzzzzzzzzzzzz").is_err());
    }
}
