//! Lenient field decoding for inventory records.
//!
//! The inventory collaborator is not trusted to send well-typed records: a
//! capacity figure may arrive as a string, a flag as `"false"`. Decoding such
//! a server must not fail the whole request; the validity filter rejects it
//! and names the offending field.
//!
//! [`Lenient<T>`] keeps the three outcomes apart so the filter can tell
//! "absent" from "present but wrong".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A record field that may be missing, well-typed, or malformed.
#[derive(Debug, Clone, PartialEq)]
pub enum Lenient<T> {
    /// Field absent or `null`.
    Missing,
    /// Field present and decoded as `T`.
    Valid(T),
    /// Field present but not decodable as `T`; the raw JSON is kept for messages.
    Malformed(serde_json::Value),
}

impl<T> Lenient<T> {
    /// The decoded value, if the field was well-typed.
    pub fn valid(&self) -> Option<&T> {
        match self {
            Lenient::Valid(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Lenient::Missing)
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Lenient::Malformed(_))
    }

    /// Render the field the way it appeared on the wire.
    pub fn describe(&self) -> String
    where
        T: Serialize,
    {
        match self {
            Lenient::Missing => "null".to_string(),
            Lenient::Valid(v) => serde_json::to_string(v).unwrap_or_else(|_| "?".to_string()),
            Lenient::Malformed(raw) => raw.to_string(),
        }
    }
}

impl Lenient<String> {
    pub fn as_str(&self) -> Option<&str> {
        self.valid().map(String::as_str)
    }
}

impl<T: Copy> Lenient<T> {
    /// The decoded value by copy.
    pub fn get(&self) -> Option<T> {
        self.valid().copied()
    }
}

impl<T> Default for Lenient<T> {
    fn default() -> Self {
        Lenient::Missing
    }
}

impl<T> From<T> for Lenient<T> {
    fn from(value: T) -> Self {
        Lenient::Valid(value)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Lenient<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if raw.is_null() {
            return Ok(Lenient::Missing);
        }
        Ok(match serde_json::from_value::<T>(raw.clone()) {
            Ok(value) => Lenient::Valid(value),
            Err(_) => Lenient::Malformed(raw),
        })
    }
}

impl<T: Serialize> Serialize for Lenient<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Lenient::Missing => serializer.serialize_none(),
            Lenient::Valid(v) => v.serialize(serializer),
            Lenient::Malformed(raw) => raw.serialize(serializer),
        }
    }
}
