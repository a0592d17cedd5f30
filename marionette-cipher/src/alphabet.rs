#![forbid(unsafe_code)]

use crate::{Dfa, Error, Result};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

/// Ranking over the fixed-length words of a single character class.
///
/// Accepts `^[class]{n}$`, `[class]{n}` and `[class]+` (the latter takes its
/// length from `msg_len`). Words are base-`k` numerals, most significant
/// character first, where `k` is the class size.
#[derive(Debug, Clone)]
pub struct AlphabetDfa {
    alphabet: Vec<char>,
    len: usize,
    words: BigUint,
    capacity: usize,
}

impl AlphabetDfa {
    pub fn new(regex: &str, msg_len: usize) -> Result<Self> {
        let body = regex.strip_prefix('^').unwrap_or(regex);
        let body = body.strip_suffix('$').unwrap_or(body);
        let (class, quantifier) = split_class(body).ok_or_else(|| Error::unsupported(format!("regex {regex:?} is not a single character class")))?;
        let alphabet = parse_class(class)?;
        if alphabet.len() < 2 {
            return Err(Error::unsupported(format!("regex {regex:?} has fewer than two symbols")));
        }
        let len = match quantifier {
            "+" | "*" => msg_len,
            q => q
                .strip_prefix('{')
                .and_then(|q| q.strip_suffix('}'))
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| Error::unsupported(format!("unsupported quantifier {q:?}")))?,
        };
        if len == 0 {
            return Err(Error::unsupported("zero-length words"));
        }
        let words = BigUint::from(alphabet.len()).pow(len as u32);
        let mut capacity = 0usize;
        let mut span = BigUint::from(256u32);
        while span <= words {
            capacity += 1;
            span <<= 8;
        }
        Ok(Self { alphabet, len, words, capacity })
    }

    /// Characters per word.
    pub fn word_len(&self) -> usize {
        self.len
    }

    /// Number of distinct words.
    pub fn words(&self) -> &BigUint {
        &self.words
    }

    pub fn alphabet(&self) -> &[char] {
        &self.alphabet
    }
}

impl Dfa for AlphabetDfa {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn rank(&self, word: &str) -> Result<BigUint> {
        let k = BigUint::from(self.alphabet.len());
        let mut n = BigUint::zero();
        let mut count = 0;
        for c in word.chars() {
            let digit = self
                .alphabet
                .binary_search(&c)
                .map_err(|_| Error::malformed(format!("symbol {c:?} outside the alphabet")))?;
            n = n * &k + BigUint::from(digit);
            count += 1;
        }
        if count != self.len {
            return Err(Error::malformed(format!("word has {count} symbols, expected {}", self.len)));
        }
        Ok(n)
    }

    fn unrank(&self, n: &BigUint) -> Result<String> {
        if n >= &self.words {
            return Err(Error::malformed("rank outside the language"));
        }
        let k = BigUint::from(self.alphabet.len());
        let mut rest = n.clone();
        let mut out = vec![self.alphabet[0]; self.len];
        for slot in out.iter_mut().rev() {
            if rest.is_zero() {
                break;
            }
            let digit = (&rest % &k).to_usize().unwrap_or(0);
            *slot = self.alphabet[digit];
            rest /= &k;
        }
        Ok(out.into_iter().collect())
    }
}

/// `[...]` followed by a quantifier.
fn split_class(body: &str) -> Option<(&str, &str)> {
    let inner = body.strip_prefix('[')?;
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ']' if i > 0 => return Some((&inner[..i], &inner[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_class(class: &str) -> Result<Vec<char>> {
    if class.starts_with('^') {
        return Err(Error::unsupported("negated character classes"));
    }
    let mut symbols = Vec::new();
    let mut chars = class.chars().peekable();
    while let Some(c) = chars.next() {
        let lo = if c == '\\' { unescape(chars.next())? } else { c };
        let is_range = chars.peek() == Some(&'-') && {
            let mut ahead = chars.clone();
            ahead.next();
            ahead.peek().is_some()
        };
        if !is_range {
            symbols.push(lo);
            continue;
        }
        chars.next();
        let hi = match chars.next() {
            Some('\\') => unescape(chars.next())?,
            Some(h) => h,
            None => return Err(Error::unsupported("dangling range")),
        };
        if hi < lo {
            return Err(Error::unsupported(format!("reversed range {lo}-{hi}")));
        }
        symbols.extend(lo..=hi);
    }
    symbols.sort_unstable();
    symbols.dedup();
    Ok(symbols)
}

fn unescape(c: Option<char>) -> Result<char> {
    match c {
        Some('n') => Ok('\n'),
        Some('r') => Ok('\r'),
        Some('t') => Ok('\t'),
        Some(c) if !c.is_ascii_alphanumeric() => Ok(c),
        Some(c) => Err(Error::unsupported(format!("escape \\{c} in character class"))),
        None => Err(Error::unsupported("dangling escape")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_parsing() {
        let d = AlphabetDfa::new(r"^[a-c\-.x-z]{4}$", 0).unwrap();
        assert_eq!(d.alphabet(), &['-', '.', 'a', 'b', 'c', 'x', 'y', 'z']);
        assert_eq!(d.word_len(), 4);
        let trailing_dash = AlphabetDfa::new("[ab-]{2}", 0).unwrap();
        assert_eq!(trailing_dash.alphabet(), &['-', 'a', 'b']);
    }

    #[test]
    fn plus_takes_message_length() {
        let d = AlphabetDfa::new("^[a-z0-9]+$", 63).unwrap();
        assert_eq!(d.word_len(), 63);
        assert_eq!(d.capacity(), 40);
    }

    #[test]
    fn rank_and_unrank_are_inverse() {
        let d = AlphabetDfa::new("^[ab]{3}$", 0).unwrap();
        assert_eq!(d.words(), &BigUint::from(8u32));
        assert_eq!(d.rank("aaa").unwrap(), BigUint::zero());
        assert_eq!(d.rank("bab").unwrap(), BigUint::from(5u32));
        assert_eq!(d.unrank(&BigUint::from(5u32)).unwrap(), "bab");
        assert_eq!(d.unrank(&BigUint::zero()).unwrap(), "aaa");
        assert!(d.unrank(&BigUint::from(8u32)).is_err());
        assert!(d.rank("ba").is_err());
        assert!(d.rank("bac").is_err());
    }

    #[test]
    fn capacity_is_whole_bytes() {
        assert_eq!(AlphabetDfa::new("^[0-9a-f]{4}$", 0).unwrap().capacity(), 2);
        assert_eq!(AlphabetDfa::new("^[0-9a-f]{3}$", 0).unwrap().capacity(), 1);
        assert_eq!(AlphabetDfa::new("^[ab]{7}$", 0).unwrap().capacity(), 0);
    }

    #[test]
    fn unsupported_shapes() {
        assert!(AlphabetDfa::new("^.*$", 10).is_err());
        assert!(AlphabetDfa::new("^[^a]{3}$", 10).is_err());
        assert!(AlphabetDfa::new("^[a]{3}$", 10).is_err());
        assert!(AlphabetDfa::new("^[a-z]{x}$", 10).is_err());
        assert!(AlphabetDfa::new("^[z-a]{3}$", 10).is_err());
    }
}
