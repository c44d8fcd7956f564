// Nix flavoured base32
//
// Nix encodes hashes with its own alphabet (no e, o, t, u) and walks the
// input bits from the end, so the output is not RFC 4648 base32.

use crate::error::{CacheServerError, Result};

/// The Nix base32 alphabet
pub const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Length of the encoding of `len` bytes
pub fn encoded_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len * 8 - 1) / 5 + 1
    }
}

/// Encode bytes in Nix base32
pub fn encode(bytes: &[u8]) -> String {
    let len = encoded_len(bytes.len());
    let mut out = String::with_capacity(len);

    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let low = (bytes[i] as u16) >> j;
        let high = if i + 1 < bytes.len() {
            (bytes[i + 1] as u16) << (8 - j)
        } else {
            0
        };
        let c = ((low | high) & 0x1f) as usize;
        out.push(ALPHABET[c] as char);
    }

    out
}

/// Decode a Nix base32 string
pub fn decode(input: &str) -> Result<Vec<u8>> {
    let size = input.len() * 5 / 8;
    let mut bytes = vec![0u8; size];

    for (n, ch) in input.bytes().rev().enumerate() {
        let digit = ALPHABET
            .iter()
            .position(|&c| c == ch)
            .ok_or_else(|| {
                CacheServerError::InvalidRequest(format!(
                    "Invalid nix base32 character '{}'",
                    ch as char
                ))
            })? as u16;

        let b = n * 5;
        let i = b / 8;
        let j = b % 8;

        if i < size {
            bytes[i] |= (digit << j) as u8;
        }

        let carry = digit >> (8 - j);
        if i + 1 < size {
            bytes[i + 1] |= carry as u8;
        } else if carry != 0 {
            return Err(CacheServerError::InvalidRequest(format!(
                "Invalid nix base32 string '{}'",
                input
            )));
        }
    }

    Ok(bytes)
}

/// Whether every character belongs to the alphabet
pub fn is_valid(input: &str) -> bool {
    input.bytes().all(|c| ALPHABET.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_empty_sha256() {
        let digest = Sha256::digest(b"");
        assert_eq!(
            encode(&digest),
            "0mdqa9w1p6cmli6976v4wi0sw9r4p5prkj7lzfd1877wk11c9c73"
        );
    }

    #[test]
    fn test_decode_inverts_encode() {
        let digest = Sha256::digest(b"hello nix");
        let encoded = encode(&digest);
        assert_eq!(encoded.len(), 52);
        assert_eq!(decode(&encoded).unwrap(), digest.to_vec());

        let store_hash = encode(&digest[..20]);
        assert_eq!(store_hash.len(), 32);
        assert_eq!(decode(&store_hash).unwrap(), digest[..20].to_vec());
    }

    #[test]
    fn test_rejects_foreign_characters() {
        assert!(decode("eeee").is_err());
        assert!(!is_valid("0123u"));
        assert!(is_valid("0123z"));
    }
}
