//! The replication watermark: a `(major, minor)` version whose canonical
//! string form sorts correctly as bytes.
//!
//! `major` is the upstream log position (an opaque lexicographic string over
//! `[0-9a-z]`). `minor` is a local sub-counter used to stack synthetic
//! transactions (backfills) on top of a given upstream version. The canonical
//! form is `major` alone when `minor == 0`, else `major + "." + enc(minor)`
//! where `enc` writes the minor in base36 behind a digit-count character, so
//! longer (larger) encodings sort after shorter ones.

use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

const BASE: u64 = 36;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Watermark {
    // Field order carries the `Ord` derive: majors compare first, then
    // minors numerically. This matches byte order of the canonical string
    // because '.' sorts below the major/minor alphabet.
    major: String,
    minor: u64,
}

impl Watermark {
    pub fn new(major: impl Into<String>, minor: u64) -> anyhow::Result<Self> {
        let major = major.into();
        validate_major(&major)?;
        Ok(Self { major, minor })
    }

    pub fn major(&self) -> &str {
        &self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// The next stackable version on top of `self`: same upstream position,
    /// next local sub-counter.
    pub fn succ(&self) -> Self {
        Self {
            major: self.major.clone(),
            minor: self.minor + 1,
        }
    }

    /// Whether this watermark was generated locally (backfill transactions
    /// always stack above the upstream version they snapshot at).
    pub fn is_synthetic(&self) -> bool {
        self.minor > 0
    }
}

fn validate_major(major: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!major.is_empty(), "Empty watermark");
    anyhow::ensure!(
        major
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()),
        "Invalid watermark major {major:?}: must be lexicographic [0-9a-z]"
    );
    Ok(())
}

fn encode_minor(mut minor: u64) -> String {
    debug_assert!(minor > 0);
    let mut digits = Vec::new();
    while minor > 0 {
        digits.push(std::char::from_digit((minor % BASE) as u32, BASE as u32).unwrap());
        minor /= BASE;
    }
    digits.push(std::char::from_digit(digits.len() as u32 - 1, BASE as u32).unwrap());
    digits.reverse();
    digits.into_iter().collect()
}

fn decode_minor(encoded: &str) -> anyhow::Result<u64> {
    let mut chars = encoded.chars();
    let len_char = chars
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty minor version"))?;
    let num_digits = len_char
        .to_digit(BASE as u32)
        .ok_or_else(|| anyhow::anyhow!("Invalid minor length prefix {len_char:?}"))?
        as usize
        + 1;
    let digits = chars.as_str();
    anyhow::ensure!(
        digits.len() == num_digits,
        "Minor version {encoded:?} does not match its length prefix"
    );
    let mut minor: u64 = 0;
    for c in digits.chars() {
        let d = c
            .to_digit(BASE as u32)
            .ok_or_else(|| anyhow::anyhow!("Invalid minor digit {c:?}"))?;
        minor = minor
            .checked_mul(BASE)
            .and_then(|m| m.checked_add(d as u64))
            .ok_or_else(|| anyhow::anyhow!("Minor version {encoded:?} overflows"))?;
    }
    anyhow::ensure!(minor > 0, "Minor version must be positive when present");
    Ok(minor)
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, encode_minor(self.minor))
        }
    }
}

impl FromStr for Watermark {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (major, minor) = match s.split_once('.') {
            None => (s, 0),
            Some((major, encoded)) => (major, decode_minor(encoded)?),
        };
        validate_major(major)?;
        Ok(Self {
            major: major.to_owned(),
            minor,
        })
    }
}

impl TryFrom<String> for Watermark {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<Watermark> for String {
    fn from(w: Watermark) -> String {
        w.to_string()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::Watermark;

    #[test]
    fn test_canonical_form() {
        let w: Watermark = "130".parse().unwrap();
        assert_eq!(w.major(), "130");
        assert_eq!(w.minor(), 0);
        assert_eq!(w.succ().to_string(), "130.01");
        assert_eq!(Watermark::new("130", 35).unwrap().to_string(), "130.0z");
        assert_eq!(Watermark::new("130", 36).unwrap().to_string(), "130.110");
    }

    #[test]
    fn test_malformed() {
        assert!("".parse::<Watermark>().is_err());
        assert!("1A0".parse::<Watermark>().is_err());
        assert!("130.".parse::<Watermark>().is_err());
        assert!("130.0".parse::<Watermark>().is_err());
        assert!("130.1z".parse::<Watermark>().is_err());
        assert!("130.00".parse::<Watermark>().is_err());
    }

    fn arb_watermark() -> impl Strategy<Value = Watermark> {
        ("[0-9a-z]{1,8}", 0u64..10_000).prop_map(|(major, minor)| {
            Watermark::new(major, minor).unwrap()
        })
    }

    proptest! {
        #[test]
        fn proptest_round_trip(w in arb_watermark()) {
            let s = w.to_string();
            let parsed: Watermark = s.parse().unwrap();
            prop_assert_eq!(&parsed, &w);
            prop_assert_eq!(parsed.to_string(), s);
        }

        #[test]
        fn proptest_order_matches_string_order(a in arb_watermark(), b in arb_watermark()) {
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }

        #[test]
        fn proptest_succ_increases(w in arb_watermark()) {
            let next = w.succ();
            prop_assert!(next > w);
            prop_assert!(next.to_string() > w.to_string());
        }
    }
}
