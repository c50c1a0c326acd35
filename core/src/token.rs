use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A node's position in the partition keyspace.
///
/// Stored and transported as a decimal string so both the Murmur3 range
/// (signed 64-bit) and the Random range (`[0, 2^127)`) fit one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(i128);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid token {0:?}: expected a decimal integer")]
pub struct ParseTokenError(String);

impl Token {
    pub const fn new(value: i128) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i128 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i128>()
            .map(Self)
            .map_err(|_| ParseTokenError(s.to_string()))
    }
}

impl TryFrom<String> for Token {
    type Error = ParseTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.to_string()
    }
}

/// Keyspace layout of the data store's partitioner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Partitioner {
    /// `[-2^63, 2^63)`
    #[default]
    Murmur3,
    /// `[0, 2^127)`
    Random,
}

impl Partitioner {
    pub fn min(&self) -> i128 {
        match self {
            Self::Murmur3 => i64::MIN as i128,
            Self::Random => 0,
        }
    }

    /// Number of distinct tokens in the keyspace.
    pub fn keyspace(&self) -> u128 {
        match self {
            Self::Murmur3 => 1u128 << 64,
            Self::Random => 1u128 << 127,
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        match token.0.checked_sub(self.min()) {
            Some(offset) if offset >= 0 => (offset as u128) < self.keyspace(),
            _ => false,
        }
    }

    /// Token at `offset` from the start of the keyspace, wrapping around.
    fn at(&self, offset: u128) -> Token {
        Token(self.min() + (offset % self.keyspace()) as i128)
    }

    fn offset_of(&self, token: Token) -> u128 {
        (token.0 - self.min()) as u128
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Murmur3 => "murmur3",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Partitioner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "murmur3" | "murmur3partitioner" => Ok(Self::Murmur3),
            "random" | "randompartitioner" => Ok(Self::Random),
            other => Err(format!("unknown partitioner {other:?}")),
        }
    }
}

/// Computes candidate tokens for joining nodes.
///
/// The keyspace is cut into `racks × nodes_per_rack` equal segments. Segment
/// boundaries are handed out round-robin by rack, so consecutive segments
/// belong to different racks and coverage stays balanced while racks fill
/// unevenly.
#[derive(Debug, Clone)]
pub struct TokenPlacement {
    partitioner: Partitioner,
    nodes_per_rack: u32,
}

impl TokenPlacement {
    pub fn new(partitioner: Partitioner, nodes_per_rack: u32) -> Self {
        Self {
            partitioner,
            nodes_per_rack: nodes_per_rack.max(1),
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    fn datacenter_size(&self, rack_count: usize) -> u128 {
        rack_count.max(1) as u128 * self.nodes_per_rack as u128
    }

    /// Width of one segment for a datacenter with `rack_count` racks.
    pub fn segment(&self, rack_count: usize) -> u128 {
        self.partitioner.keyspace() / self.datacenter_size(rack_count)
    }

    /// Segment index owned by `id` in rack `rack_index`.
    pub fn slot(&self, id: u32, rack_index: usize, rack_count: usize) -> u128 {
        let racks = rack_count.max(1) as u128;
        let position = id as u128 / racks;
        (position * racks + rack_index as u128) % self.datacenter_size(rack_count)
    }

    /// First-choice token for `id`.
    pub fn base_token(
        &self,
        datacenter: &str,
        id: u32,
        rack_index: usize,
        rack_count: usize,
    ) -> Token {
        let segment = self.segment(rack_count);
        let slot = self.slot(id, rack_index, rack_count);
        let offset = datacenter_offset(datacenter) % segment.max(1);
        self.partitioner.at(segment * slot + offset)
    }

    /// Shifts `base` forward by `jitter`, wrapping around the keyspace.
    pub fn perturb(&self, base: Token, jitter: u128) -> Token {
        self.partitioner
            .at(self.partitioner.offset_of(base) + jitter)
    }

    /// Candidate for the given attempt. Attempt 0 is the base token; later
    /// attempts land at a random point in the first half of the segment.
    pub fn candidate(
        &self,
        datacenter: &str,
        id: u32,
        rack_index: usize,
        rack_count: usize,
        attempt: u32,
    ) -> Token {
        let base = self.base_token(datacenter, id, rack_index, rack_count);
        if attempt == 0 {
            return base;
        }
        let max_jitter = (self.segment(rack_count) / 2).max(1);
        let jitter = rand::thread_rng().gen_range(1..=max_jitter);
        self.perturb(base, jitter)
    }
}

/// Rack order used for interleaving: configured racks first, then any other
/// rack known to the datacenter in sorted order.
pub fn rack_order<'a>(
    configured: &[String],
    seen: impl IntoIterator<Item = &'a str>,
    rack: &'a str,
) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(configured.len() + 1);
    for r in configured {
        if !order.contains(r) {
            order.push(r.clone());
        }
    }
    let extra: BTreeSet<&str> = seen
        .into_iter()
        .chain(std::iter::once(rack))
        .filter(|r| !configured.iter().any(|c| c == r))
        .collect();
    order.extend(extra.into_iter().map(str::to_string));
    order
}

/// FNV-1a over the datacenter name, truncated to 32 bits.
#[inline]
fn datacenter_offset(datacenter: &str) -> u128 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in datacenter.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash as u32) as u128
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn racks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_token_parses_and_displays_decimal() {
        let token: Token = "-9223372036854775808".parse().unwrap();
        assert_eq!(token.value(), i64::MIN as i128);
        assert_eq!(token.to_string(), "-9223372036854775808");
        assert!("abc".parse::<Token>().is_err());
        assert!("".parse::<Token>().is_err());
    }

    #[test]
    fn test_token_serializes_as_string() {
        let json = serde_json::to_string(&Token::new(42)).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Token::new(42));
    }

    #[test]
    fn test_partitioner_ranges() {
        assert!(Partitioner::Murmur3.contains(Token::new(i64::MIN as i128)));
        assert!(Partitioner::Murmur3.contains(Token::new(i64::MAX as i128)));
        assert!(!Partitioner::Murmur3.contains(Token::new(i64::MAX as i128 + 1)));
        assert!(!Partitioner::Random.contains(Token::new(-1)));
        assert!(Partitioner::Random.contains(Token::new(i128::MAX)));
        assert!(!Partitioner::Murmur3.contains(Token::new(i128::MAX)));
    }

    #[test]
    fn test_partitioner_from_str() {
        assert_eq!("Murmur3".parse::<Partitioner>(), Ok(Partitioner::Murmur3));
        assert_eq!("random".parse::<Partitioner>(), Ok(Partitioner::Random));
        assert!("bytes".parse::<Partitioner>().is_err());
    }

    #[test]
    fn test_slots_interleave_racks() {
        let placement = TokenPlacement::new(Partitioner::Murmur3, 2);
        // ids 0..6 spread round-robin over three racks
        let slots: Vec<u128> = (0..6u32)
            .map(|id| placement.slot(id, id as usize % 3, 3))
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_distinct_slots_give_distinct_tokens_in_range() {
        for partitioner in [Partitioner::Murmur3, Partitioner::Random] {
            let placement = TokenPlacement::new(partitioner, 4);
            let mut seen = HashSet::new();
            for id in 0..12u32 {
                let token = placement.base_token("us-east", id, id as usize % 3, 3);
                assert!(partitioner.contains(token), "{token} out of range");
                assert!(seen.insert(token), "duplicate token {token}");
            }
        }
    }

    #[test]
    fn test_tokens_are_evenly_spaced() {
        let placement = TokenPlacement::new(Partitioner::Random, 2);
        let a = placement.base_token("dc1", 0, 0, 2);
        let b = placement.base_token("dc1", 1, 1, 2);
        let c = placement.base_token("dc1", 2, 0, 2);
        let segment = placement.segment(2) as i128;
        assert_eq!(b.value() - a.value(), segment);
        assert_eq!(c.value() - b.value(), segment);
    }

    #[test]
    fn test_datacenters_get_different_offsets() {
        let placement = TokenPlacement::new(Partitioner::Murmur3, 3);
        let east = placement.base_token("us-east", 0, 0, 1);
        let west = placement.base_token("us-west", 0, 0, 1);
        assert_ne!(east, west);
    }

    #[test]
    fn test_perturbed_candidate_stays_within_segment() {
        let placement = TokenPlacement::new(Partitioner::Murmur3, 3);
        let base = placement.base_token("dc1", 4, 1, 3);
        let half = placement.segment(3) / 2;
        for attempt in 1..20 {
            let candidate = placement.candidate("dc1", 4, 1, 3, attempt);
            assert_ne!(candidate, base);
            let distance = (candidate.value() - base.value()) as u128;
            assert!(distance >= 1 && distance <= half);
        }
        assert_eq!(placement.candidate("dc1", 4, 1, 3, 0), base);
    }

    #[test]
    fn test_perturb_wraps_around_keyspace() {
        let placement = TokenPlacement::new(Partitioner::Murmur3, 1);
        let last = Token::new(i64::MAX as i128);
        assert_eq!(placement.perturb(last, 1), Token::new(i64::MIN as i128));
    }

    #[test]
    fn test_rack_order_configured_first_then_sorted() {
        let order = rack_order(&racks(&["1c", "1a"]), ["1b", "1a", "1d"], "1e");
        assert_eq!(order, racks(&["1c", "1a", "1b", "1d", "1e"]));
    }

    #[test]
    fn test_rack_order_without_configuration() {
        let order = rack_order(&[], ["1b"], "1a");
        assert_eq!(order, racks(&["1a", "1b"]));
    }

    #[test]
    fn test_rack_order_borrows_from_owned_racks() {
        let peers: Vec<String> = vec!["1b".into(), "1d".into()];
        let joining = String::from("1c");
        let order = rack_order(
            &racks(&["1a"]),
            peers.iter().map(String::as_str),
            joining.as_str(),
        );
        assert_eq!(order, racks(&["1a", "1b", "1c", "1d"]));
    }
}
