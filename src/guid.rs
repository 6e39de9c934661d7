//! 16 byte random identifiers.
//!
//! Session ids, call correlation keys and delegate handler keys are all
//! [Guid]s. When message encryption is enabled the session id doubles as
//! the AES key, so it is always drawn from the OS RNG.

use rand::RngCore as _;

/// A random 16 byte identifier.
///
/// Displays and serializes as 32 lowercase hex characters. The all-zero
/// value is reserved as [Guid::NIL] and never returned by [Guid::random].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid([u8; Self::SIZE]);

impl Guid {
    pub const SIZE: usize = 16;

    /// The all-zero identifier.
    pub const NIL: Guid = Guid([0u8; Self::SIZE]);

    /// Generate a fresh identifier from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::SIZE];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; Self::SIZE] {
                return Guid(bytes);
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Guid(bytes)
    }

    /// `None` unless `slice` is exactly [Guid::SIZE] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != Self::SIZE {
            return None;
        }
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(slice);
        Some(Guid(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; Self::SIZE]
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// Error returned from [Guid::from_str][std::str::FromStr].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Invalid guid string {value:?}")]
pub struct GuidParseError {
    pub value: String,
}

impl std::str::FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GuidParseError {
            value: s.to_string(),
        };
        if s.len() != Self::SIZE * 2 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; Self::SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Guid(bytes))
    }
}

impl serde::Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|_| D::Error::invalid_value(serde::de::Unexpected::Str(&value), &"a hex guid"))
    }
}

#[cfg(test)]
impl proptest::arbitrary::Arbitrary for Guid {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Guid>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        use proptest::prelude::*;
        any::<[u8; Guid::SIZE]>().prop_map(Guid::from_bytes).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let guid = Guid::random();
        let parsed = guid.to_string().parse::<Guid>().unwrap();
        assert_eq!(guid, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("".parse::<Guid>().is_err());
        assert!("zz".repeat(16).parse::<Guid>().is_err());
        assert!("ab".repeat(15).parse::<Guid>().is_err());
    }

    #[test]
    fn random_is_not_nil() {
        for _ in 0..64 {
            assert!(!Guid::random().is_nil());
        }
    }

    #[test]
    fn serde_roundtrip() {
        let guid = Guid::random();
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, format!("\"{}\"", guid));
        let back: Guid = serde_json::from_str(&json).unwrap();
        assert_eq!(guid, back);
    }
}
