//! Partitioners map raw keys onto ring tokens.
//!
//! Two order-preserving partitioners coexist and are selected at
//! configuration time:
//! - [`OrderPreservingPartitioner`]: the token is the key itself.
//! - [`OdklDomainPartitioner`]: the first two hex characters of the key name
//!   a "domain" byte (0..=255) which shards large tables into 256 arcs with
//!   strong locality inside each domain.

use std::collections::HashMap;
use std::fmt;

use num_bigint::BigUint;
use rand::Rng;

use crate::errors::ConfigurationError;
use crate::routing::{DecoratedKey, Range, Token};

/// Partitioner selected in the node configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum PartitionerName {
    OrderPreserving,
    #[default]
    OdklDomain,
}

impl PartitionerName {
    pub fn from_str(name: &str) -> Option<Self> {
        if name.ends_with("OrderPreservingPartitioner") {
            Some(PartitionerName::OrderPreserving)
        } else if name.ends_with("OdklDomainPartitioner") {
            Some(PartitionerName::OdklDomain)
        } else {
            None
        }
    }

    pub fn build(&self) -> std::sync::Arc<dyn Partitioner> {
        match self {
            PartitionerName::OrderPreserving => std::sync::Arc::new(OrderPreservingPartitioner),
            PartitionerName::OdklDomain => std::sync::Arc::new(OdklDomainPartitioner),
        }
    }
}

/// Maps keys to tokens and (de)serializes tokens.
///
/// The string and byte factories must round-trip every token the partitioner
/// can produce.
pub trait Partitioner: fmt::Debug + Send + Sync {
    fn get_token(&self, key: &str) -> Token;

    fn decorate_key(&self, key: &str) -> DecoratedKey {
        DecoratedKey::new(self.get_token(key), key)
    }

    /// A token halfway between `left` and `right` on the ring, wrapping past
    /// the maximum token when `left >= right`.
    fn midpoint(&self, left: &Token, right: &Token) -> Token;

    fn minimum_token(&self) -> Token {
        Token::minimum()
    }

    /// A random token. Non-cryptographic; meant for test fixtures — real
    /// token assignment goes through the load balancer.
    fn random_token(&self) -> Token;

    fn preserves_order(&self) -> bool;

    fn validate_token(&self, token: &Token) -> Result<(), ConfigurationError>;

    fn token_to_string(&self, token: &Token) -> String {
        token.as_str().to_owned()
    }

    fn token_from_string(&self, s: &str) -> Token {
        Token::new(s)
    }

    fn token_to_bytes(&self, token: &Token) -> Vec<u8> {
        token.as_str().as_bytes().to_vec()
    }

    fn token_from_bytes(&self, bytes: &[u8]) -> Result<Token, ConfigurationError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ConfigurationError::InvalidToken("token bytes are not utf-8".into()))?;
        Ok(Token::new(s))
    }

    /// Fraction of the ring owned by each node, estimated by sampled split
    /// points: each arc `(sorted[i-1], sorted[i]]` weighs as many points as
    /// `splits` reports inside it, normalized over the ring. With no sampled
    /// points at all the fractions are all zero and ownership is undefined.
    fn describe_ownership(
        &self,
        sorted_tokens: &[Token],
        splits: &dyn Fn(&Range) -> usize,
    ) -> HashMap<Token, f64> {
        describe_ownership_by_splits(sorted_tokens, splits)
    }
}

fn describe_ownership_by_splits(
    sorted_tokens: &[Token],
    splits: &dyn Fn(&Range) -> usize,
) -> HashMap<Token, f64> {
    let Some(last) = sorted_tokens.last() else {
        return HashMap::new();
    };

    let mut counts: HashMap<Token, f64> = HashMap::with_capacity(sorted_tokens.len());
    let mut left = last.clone();
    for token in sorted_tokens {
        let arc = Range::new(left, token.clone());
        *counts.entry(token.clone()).or_insert(0.0) += splits(&arc) as f64;
        left = token.clone();
    }

    let total: f64 = counts.values().sum();
    if total > 0.0 {
        for count in counts.values_mut() {
            *count /= total;
        }
    }
    counts
}

const RANDOM_TOKEN_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const RANDOM_TOKEN_LEN: usize = 16;

fn random_alnum(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| RANDOM_TOKEN_CHARS[rng.gen_range(0..RANDOM_TOKEN_CHARS.len())] as char)
        .collect()
}

/// Packs the token's UTF-16 code units into an unsigned big integer of
/// `sigchars` 16-bit limbs, left-aligned.
fn big_for_token(token: &Token, sigchars: usize) -> BigUint {
    let mut bytes = Vec::with_capacity(sigchars * 2);
    for unit in token.as_str().encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    debug_assert!(bytes.len() <= sigchars * 2);
    bytes.resize(sigchars * 2, 0);
    BigUint::from_bytes_be(&bytes)
}

/// Inverse of [`big_for_token`]. With `remainder` set an extra code unit with
/// only the high bit enabled is appended, representing the half step lost to
/// integer division.
fn token_for_big(big: &BigUint, sigchars: usize, remainder: bool) -> Token {
    let raw = big.to_bytes_be();
    let mut bytes = vec![0u8; sigchars * 2];
    // `raw` can only be longer than the target when the value is zero and
    // sigchars is zero (to_bytes_be of zero is a single zero byte)
    let take = raw.len().min(bytes.len());
    let offset = bytes.len() - take;
    bytes[offset..].copy_from_slice(&raw[raw.len() - take..]);

    let mut units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if remainder {
        units.push(0x8000);
    }
    // Code units in the surrogate block cannot appear in a Rust string;
    // clamp just below it. Keys never contain surrogates.
    let s: String = units
        .into_iter()
        .map(|u| if (0xd800..=0xdfff).contains(&u) { 0xd7ff } else { u })
        .map(|u| char::from_u32(u as u32).unwrap_or('\u{fffd}'))
        .collect();
    Token::new(s)
}

fn order_preserving_midpoint(left: &Token, right: &Token) -> Token {
    let sigchars = left
        .as_str()
        .encode_utf16()
        .count()
        .max(right.as_str().encode_utf16().count());
    let l = big_for_token(left, sigchars);
    let r = big_for_token(right, sigchars);

    let (sum, max) = if l < r {
        (&l + &r, None)
    } else {
        let max = BigUint::from(1u8) << (16 * sigchars);
        (&l + &r + &max, Some(max))
    };
    let remainder = sum.bit(0);
    let mut mid = sum >> 1usize;
    if let Some(max) = max {
        mid %= &max;
    }
    token_for_big(&mid, sigchars, remainder)
}

/// Token = key. Range queries see keys in their natural order.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderPreservingPartitioner;

impl Partitioner for OrderPreservingPartitioner {
    fn get_token(&self, key: &str) -> Token {
        Token::new(key)
    }

    fn midpoint(&self, left: &Token, right: &Token) -> Token {
        order_preserving_midpoint(left, right)
    }

    fn random_token(&self) -> Token {
        Token::new(random_alnum(RANDOM_TOKEN_LEN))
    }

    fn preserves_order(&self) -> bool {
        true
    }

    fn validate_token(&self, _token: &Token) -> Result<(), ConfigurationError> {
        Ok(())
    }
}

/// Order-preserving partitioner sharded by a two-hex-character domain
/// prefix. The domain byte carves the ring into 256 arcs; the rack-aware
/// replication strategy permutes it to spread secondary replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct OdklDomainPartitioner;

impl OdklDomainPartitioner {
    /// The domain byte encoded in the first two characters of a token.
    pub fn domain_of(&self, token: &Token) -> Result<u8, ConfigurationError> {
        let prefix = token.as_str().get(0..2).ok_or_else(|| {
            ConfigurationError::InvalidToken(format!(
                "token {token} is too short to carry a domain prefix"
            ))
        })?;
        u8::from_str_radix(prefix, 16).map_err(|_| {
            ConfigurationError::InvalidToken(format!("token {token} has a non-hex domain prefix"))
        })
    }

    /// Re-prefixes `key_token` with the hex encoding of `domain`, keeping
    /// the remainder of the token intact.
    pub fn to_string_token(&self, domain: u8, key_token: &str) -> Token {
        let rest = key_token.get(2..).unwrap_or("");
        Token::new(format!("{domain:02x}{rest}"))
    }

    /// The bare two-character token of a domain.
    pub fn domain_token(&self, domain: u8) -> Token {
        Token::new(format!("{domain:02x}"))
    }
}

impl Partitioner for OdklDomainPartitioner {
    fn get_token(&self, key: &str) -> Token {
        // the domain prefix is case-folded so "AB..." and "ab..." land in
        // the same shard; the key remainder keeps its case
        match key.get(0..2) {
            Some(prefix) if prefix.chars().any(|c| c.is_ascii_uppercase()) => Token::new(format!(
                "{}{}",
                prefix.to_ascii_lowercase(),
                key.get(2..).unwrap_or("")
            )),
            _ => Token::new(key),
        }
    }

    fn midpoint(&self, left: &Token, right: &Token) -> Token {
        order_preserving_midpoint(left, right)
    }

    fn random_token(&self) -> Token {
        let domain: u8 = rand::thread_rng().gen();
        Token::new(format!("{domain:02x}{}", random_alnum(RANDOM_TOKEN_LEN)))
    }

    fn preserves_order(&self) -> bool {
        true
    }

    fn validate_token(&self, token: &Token) -> Result<(), ConfigurationError> {
        if token.is_minimum() {
            return Ok(());
        }
        self.domain_of(token).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_preserving_token_is_key() {
        let p = OrderPreservingPartitioner;
        assert_eq!(p.get_token("abc"), Token::new("abc"));
        let dk = p.decorate_key("abc");
        assert_eq!(dk.token, Token::new("abc"));
        assert_eq!(dk.key, "abc");
    }

    #[test]
    fn midpoint_of_hex_tokens() {
        let p = OrderPreservingPartitioner;
        let mid = p.midpoint(&Token::new("0000"), &Token::new("8000"));
        assert_eq!(mid, Token::new("4000"));
    }

    #[test]
    fn midpoint_lands_inside_range() {
        let p = OrderPreservingPartitioner;
        for (l, r) in [("a", "b"), ("aa", "ab"), ("key1", "key9"), ("0", "z")] {
            let (l, r) = (Token::new(l), Token::new(r));
            let mid = p.midpoint(&l, &r);
            assert!(mid > l, "{mid} <= {l}");
            assert!(mid < r, "{mid} >= {r}");
        }
    }

    #[test]
    fn midpoint_wraps_past_maximum() {
        let p = OrderPreservingPartitioner;
        let mid = p.midpoint(&Token::new("b"), &Token::new("a"));
        let wrap = Range::new(Token::new("b"), Token::new("a"));
        assert!(wrap.contains(&mid), "{mid} outside wrapping range");
    }

    #[test]
    fn token_factories_round_trip() {
        let partitioners: [&dyn Partitioner; 2] =
            [&OrderPreservingPartitioner, &OdklDomainPartitioner];
        for p in partitioners {
            for _ in 0..32 {
                let t = p.random_token();
                p.validate_token(&t).unwrap();
                assert_eq!(p.token_from_string(&p.token_to_string(&t)), t);
                assert_eq!(p.token_from_bytes(&p.token_to_bytes(&t)).unwrap(), t);
            }
        }
    }

    #[test]
    fn domain_prefix_parsing() {
        let p = OdklDomainPartitioner;
        assert_eq!(p.domain_of(&Token::new("00rest")).unwrap(), 0);
        assert_eq!(p.domain_of(&Token::new("ff")).unwrap(), 0xff);
        assert_eq!(p.domain_of(&Token::new("2a1091")).unwrap(), 0x2a);
        assert!(p.domain_of(&Token::new("z0")).is_err());
        assert!(p.domain_of(&Token::new("0")).is_err());
    }

    #[test]
    fn domain_case_folding() {
        let p = OdklDomainPartitioner;
        assert_eq!(p.get_token("AB1091"), Token::new("ab1091"));
        assert_eq!(p.get_token("ab1091"), Token::new("ab1091"));
    }

    #[test]
    fn to_string_token_replaces_domain() {
        let p = OdklDomainPartitioner;
        assert_eq!(
            p.to_string_token(0x55, "2a1091"),
            Token::new("551091")
        );
        assert_eq!(p.to_string_token(0x0a, "ff"), Token::new("0a"));
        assert_eq!(p.domain_token(0xaa), Token::new("aa"));
    }

    #[test]
    fn validate_rejects_bad_domains() {
        let p = OdklDomainPartitioner;
        assert!(p.validate_token(&Token::minimum()).is_ok());
        assert!(p.validate_token(&Token::new("00abc")).is_ok());
        assert!(p.validate_token(&Token::new("xy")).is_err());
    }

    #[test]
    fn ownership_fractions_normalize() {
        let p = OrderPreservingPartitioner;
        let sorted = vec![Token::new("20"), Token::new("40"), Token::new("80")];
        // weight every arc by the length of its right bound's first hex digit
        let ownership = p.describe_ownership(&sorted, &|arc: &Range| match arc.right.as_str() {
            "20" => 1,
            "40" => 1,
            "80" => 2,
            _ => 0,
        });
        assert_eq!(ownership.len(), 3);
        let total: f64 = ownership.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((ownership[&Token::new("80")] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ownership_of_empty_ring_is_undefined() {
        let p = OrderPreservingPartitioner;
        assert!(p.describe_ownership(&[], &|_| 1).is_empty());
    }

    #[test]
    fn partitioner_name_selection() {
        assert_eq!(
            PartitionerName::from_str("org.example.OrderPreservingPartitioner"),
            Some(PartitionerName::OrderPreserving)
        );
        assert_eq!(
            PartitionerName::from_str("OdklDomainPartitioner"),
            Some(PartitionerName::OdklDomain)
        );
        assert_eq!(PartitionerName::from_str("RandomPartitioner"), None);
    }
}
