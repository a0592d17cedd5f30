#![forbid(unsafe_code)]

use crate::{Cipher, Error, Result};
use regex::Regex;

/// Smallest capacity worth serving: one cell header.
const MIN_CAPACITY: usize = 25;
const LEN_DIGITS: usize = 8;

/// Frames plaintext as `hex(u32 len) || hex(plaintext)`, padded with `'0'` to
/// exactly `msg_len` characters.
#[derive(Debug, Clone)]
pub struct HexFrameCipher {
    msg_len: usize,
}

impl HexFrameCipher {
    /// Fails when `regex` rejects hex text of length `msg_len`, or when a
    /// message is too short to carry a cell header.
    pub fn new(regex: &str, msg_len: usize) -> Result<Self> {
        let capacity = msg_len.saturating_sub(LEN_DIGITS) / 2;
        if capacity < MIN_CAPACITY {
            return Err(Error::Capacity { needed: MIN_CAPACITY, available: capacity });
        }
        let re = Regex::new(&format!("^(?:{regex})$")).map_err(|e| Error::unsupported(format!("regex {regex:?}: {e}")))?;
        let probe: String = "0123456789abcdef".chars().cycle().take(msg_len).collect();
        if !re.is_match(&probe) {
            return Err(Error::unsupported(format!("regex {regex:?} does not accept hex text of length {msg_len}")));
        }
        Ok(Self { msg_len })
    }

    pub fn msg_len(&self) -> usize {
        self.msg_len
    }
}

impl Cipher for HexFrameCipher {
    fn capacity(&self) -> usize {
        (self.msg_len - LEN_DIGITS) / 2
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > self.capacity() {
            return Err(Error::Capacity { needed: plaintext.len(), available: self.capacity() });
        }
        let mut out = format!("{:08x}", plaintext.len()).into_bytes();
        out.extend_from_slice(hex::encode(plaintext).as_bytes());
        out.resize(self.msg_len, b'0');
        Ok(out)
    }

    fn decrypt<'a>(&self, ciphertext: &'a [u8]) -> Result<(Vec<u8>, &'a [u8])> {
        if ciphertext.len() < self.msg_len {
            return Err(Error::Incomplete);
        }
        let (msg, rest) = ciphertext.split_at(self.msg_len);
        let len_hex = std::str::from_utf8(&msg[..LEN_DIGITS]).map_err(|_| Error::malformed("length prefix is not text"))?;
        let len = usize::from_str_radix(len_hex, 16).map_err(|_| Error::malformed(format!("bad length prefix {len_hex:?}")))?;
        if len > self.capacity() {
            return Err(Error::malformed(format!("declared length {len} exceeds capacity {}", self.capacity())));
        }
        let body = &msg[LEN_DIGITS..LEN_DIGITS + 2 * len];
        let plaintext = hex::decode(body).map_err(|e| Error::malformed(e.to_string()))?;
        Ok((plaintext, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_pads_to_message_length() {
        let c = HexFrameCipher::new("^.*$", 128).unwrap();
        assert_eq!(c.capacity(), 60);
        let ct = c.encrypt(b"foo").unwrap();
        assert_eq!(ct.len(), 128);
        assert!(ct.starts_with(b"00000003666f6f0"));
        let (pt, rest) = c.decrypt(&ct).unwrap();
        assert_eq!(pt, b"foo");
        assert!(rest.is_empty());
    }

    #[test]
    fn decrypt_leaves_following_bytes() {
        let c = HexFrameCipher::new("^[0-9a-f]+$", 96).unwrap();
        let mut wire = c.encrypt(b"one").unwrap();
        wire.extend(c.encrypt(b"two").unwrap());
        wire.extend_from_slice(b"00");
        let (a, rest) = c.decrypt(&wire).unwrap();
        let (b, rest) = c.decrypt(rest).unwrap();
        assert_eq!((a.as_slice(), b.as_slice()), (&b"one"[..], &b"two"[..]));
        assert_eq!(c.decrypt(rest), Err(Error::Incomplete));
    }

    #[test]
    fn construction_limits() {
        assert!(matches!(HexFrameCipher::new("^.*$", 40), Err(Error::Capacity { .. })));
        assert!(matches!(HexFrameCipher::new("^[g-z]+$", 128), Err(Error::Unsupported(_))));
        assert!(matches!(HexFrameCipher::new("(", 128), Err(Error::Unsupported(_))));
    }

    #[test]
    fn oversized_plaintext() {
        let c = HexFrameCipher::new("^.*$", 128).unwrap();
        assert_eq!(c.encrypt(&[0u8; 61]), Err(Error::Capacity { needed: 61, available: 60 }));
    }

    #[test]
    fn garbage_is_malformed() {
        let c = HexFrameCipher::new("^.*$", 64).unwrap();
        assert!(matches!(c.decrypt(&[b'z'; 64]), Err(Error::Malformed(_))));
        let mut ct = c.encrypt(b"ok").unwrap();
        ct[..8].copy_from_slice(b"ffffffff");
        assert!(matches!(c.decrypt(&ct), Err(Error::Malformed(_))));
        let mut ct = c.encrypt(b"ok").unwrap();
        ct[8] = b'x';
        assert!(matches!(c.decrypt(&ct), Err(Error::Malformed(_))));
    }
}
