use std::{fmt, str::FromStr};

use openssl::bn::{BigNum, BigNumRef};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// An arbitrary-precision unsigned integer.
///
/// Serializes as a decimal string so that values survive JSON clients that
/// cannot represent integers beyond 2^53. Deserializes from either a decimal
/// string or a JSON integer.
pub struct BigInt(BigNum);

impl BigInt {
    pub fn from_u64(value: u64) -> Result<Self> {
        Ok(Self(BigNum::from_dec_str(&value.to_string())?))
    }

    pub fn as_bn(&self) -> &BigNumRef {
        &self.0
    }

    pub fn into_bn(self) -> BigNum {
        self.0
    }

    /// Returns the value as a `u64` if it fits.
    pub fn to_u64(&self) -> Option<u64> {
        if self.0.num_bits() > 64 || self.0.is_negative() {
            return None;
        }
        self.to_string().parse().ok()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn num_bits(&self) -> i32 {
        self.0.num_bits()
    }
}

impl From<BigNum> for BigInt {
    fn from(bn: BigNum) -> Self {
        Self(bn)
    }
}

impl Clone for BigInt {
    fn clone(&self) -> Self {
        // BN_dup only fails when the allocator does, and `Clone` has no way
        // to report that
        Self(self.0.to_owned().expect("BigNum allocation failed"))
    }
}

impl PartialEq for BigInt {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BigInt {}

impl PartialOrd for BigInt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BigInt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.to_dec_str() {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInt({self})")
    }
}

impl FromStr for BigInt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidNumber(s.to_owned()));
        }
        Ok(Self(BigNum::from_dec_str(trimmed)?))
    }
}

impl Serialize for BigInt {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = self.0.to_dec_str().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }
}

struct BigIntVisitor;

impl<'de> de::Visitor<'de> for BigIntVisitor {
    type Value = BigInt;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a non-negative integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        BigInt::from_u64(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        let v = u64::try_from(v).map_err(|_| E::custom(format!("negative integer: {v}")))?;
        self.visit_u64(v)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for BigInt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BigIntVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_from_number_and_string() {
        let from_number: BigInt = serde_json::from_str("96").unwrap();
        let from_string: BigInt = serde_json::from_str("\"96\"").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number.to_u64(), Some(96));
    }

    #[test]
    fn test_serialize_large_value_as_string() {
        let value: BigInt = "340282366920938463463374607431768211457".parse().unwrap();
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            "\"340282366920938463463374607431768211457\""
        );
        assert_eq!(value.to_u64(), None);
    }

    #[test]
    fn test_clone_copies_value() {
        let value: BigInt = "340282366920938463463374607431768211457".parse().unwrap();
        let copy = value.clone();
        drop(value);
        assert_eq!(copy.to_string(), "340282366920938463463374607431768211457");
    }

    #[test]
    fn test_reject_garbage() {
        assert!("12a".parse::<BigInt>().is_err());
        assert!("".parse::<BigInt>().is_err());
        assert!("-4".parse::<BigInt>().is_err());
        assert!(serde_json::from_str::<BigInt>("-4").is_err());
    }
}
