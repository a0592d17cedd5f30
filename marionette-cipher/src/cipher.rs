#![forbid(unsafe_code)]

use crate::{AlphabetDfa, HexFrameCipher, Result};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Format-transforming cipher bound to one `(regex, msg_len)` pair.
pub trait Cipher: Send + Sync {
    /// Largest plaintext, in bytes, that fits one message.
    fn capacity(&self) -> usize;
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Decode one message from the front of `ciphertext`, returning the
    /// plaintext and whatever follows the message.
    fn decrypt<'a>(&self, ciphertext: &'a [u8]) -> Result<(Vec<u8>, &'a [u8])>;
}

/// Bijection between integers and the fixed-length words of a regular language.
pub trait Dfa: Send + Sync {
    /// Bytes that can always be represented by one word.
    fn capacity(&self) -> usize;
    fn rank(&self, word: &str) -> Result<BigUint>;
    fn unrank(&self, n: &BigUint) -> Result<String>;
}

pub trait CipherFactory: Send + Sync {
    fn cipher(&self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>>;
    fn dfa(&self, regex: &str, msg_len: usize) -> Result<Arc<dyn Dfa>>;
}

/// In-process backends: [`HexFrameCipher`] and [`AlphabetDfa`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCipherFactory;

impl CipherFactory for DefaultCipherFactory {
    fn cipher(&self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
        Ok(Arc::new(HexFrameCipher::new(regex, msg_len)?))
    }

    fn dfa(&self, regex: &str, msg_len: usize) -> Result<Arc<dyn Dfa>> {
        Ok(Arc::new(AlphabetDfa::new(regex, msg_len)?))
    }
}

/// Per-session memo of constructed backends.
pub struct CipherCache {
    factory: Arc<dyn CipherFactory>,
    ciphers: HashMap<(String, usize), Arc<dyn Cipher>>,
    dfas: HashMap<(String, usize), Arc<dyn Dfa>>,
}

impl CipherCache {
    pub fn new(factory: Arc<dyn CipherFactory>) -> Self {
        Self { factory, ciphers: HashMap::new(), dfas: HashMap::new() }
    }

    pub fn cipher(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
        let key = (regex.to_string(), msg_len);
        if let Some(c) = self.ciphers.get(&key) {
            return Ok(c.clone());
        }
        let c = self.factory.cipher(regex, msg_len)?;
        debug!(regex, msg_len, capacity = c.capacity(), "cipher constructed");
        self.ciphers.insert(key, c.clone());
        Ok(c)
    }

    pub fn dfa(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Dfa>> {
        let key = (regex.to_string(), msg_len);
        if let Some(d) = self.dfas.get(&key) {
            return Ok(d.clone());
        }
        let d = self.factory.dfa(regex, msg_len)?;
        debug!(regex, msg_len, capacity = d.capacity(), "dfa constructed");
        self.dfas.insert(key, d.clone());
        Ok(d)
    }

    pub fn len(&self) -> usize {
        self.ciphers.len() + self.dfas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
