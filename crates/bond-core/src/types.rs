//! Shared domain types.
//!
//! Identities, canonical pair keys and the two persisted record shapes. The
//! serde field names of [`PairRecord`] and [`IdentityRecord`] match the
//! document store collections (`pairs` and `users`).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Maximum accepted identity length in characters.
pub const MAX_IDENTITY_LENGTH: usize = 64;

static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("identity pattern is valid"));

/// Errors produced while parsing an [`Identity`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity was empty after trimming.
    #[error("Identity cannot be empty")]
    Empty,

    /// The identity exceeds [`MAX_IDENTITY_LENGTH`].
    #[error("Identity exceeds maximum length of {max} characters (got {actual})")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length provided.
        actual: usize,
    },

    /// The identity contains characters outside `[a-z0-9._-]`.
    #[error("Identity '{0}' contains invalid characters. Allowed: a-z, 0-9, '.', '_', '-'")]
    InvalidCharacters(String),
}

/// A short unique user identity.
///
/// Identities are trimmed and lower-cased on parse so that the same user
/// always produces the same canonical pair key and the same similarity
/// profile lookup.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Parse and normalize a raw identity string.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if the value is empty, too long or contains
    /// characters outside `[a-z0-9._-]`.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(IdentityError::Empty);
        }
        let length = normalized.chars().count();
        if length > MAX_IDENTITY_LENGTH {
            return Err(IdentityError::TooLong {
                max: MAX_IDENTITY_LENGTH,
                actual: length,
            });
        }
        if !IDENTITY_PATTERN.is_match(&normalized) {
            return Err(IdentityError::InvalidCharacters(normalized));
        }
        Ok(Self(normalized))
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl std::str::FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Which half of a pair an identity occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The lexicographically smaller identity (`ID1`).
    Low,
    /// The lexicographically larger identity (`ID2`).
    High,
}

impl Side {
    /// The opposite side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

/// Canonical key of an unordered pair of distinct identities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    low: Identity,
    high: Identity,
}

impl PairKey {
    /// Order two identities into a canonical key.
    ///
    /// Returns `None` when both identities are equal.
    #[must_use]
    pub fn canonical(a: &Identity, b: &Identity) -> Option<Self> {
        match a.cmp(b) {
            std::cmp::Ordering::Less => Some(Self {
                low: a.clone(),
                high: b.clone(),
            }),
            std::cmp::Ordering::Greater => Some(Self {
                low: b.clone(),
                high: a.clone(),
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The lexicographically smaller identity.
    #[must_use]
    pub const fn low(&self) -> &Identity {
        &self.low
    }

    /// The lexicographically larger identity.
    #[must_use]
    pub const fn high(&self) -> &Identity {
        &self.high
    }

    /// The identity occupying `side`.
    #[must_use]
    pub const fn identity(&self, side: Side) -> &Identity {
        match side {
            Side::Low => &self.low,
            Side::High => &self.high,
        }
    }

    /// The side `identity` occupies, if it belongs to this pair.
    #[must_use]
    pub fn side_of(&self, identity: &Identity) -> Option<Side> {
        if identity == &self.low {
            Some(Side::Low)
        } else if identity == &self.high {
            Some(Side::High)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.low, self.high)
    }
}

/// One relationship document per unordered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PairRecord {
    /// Document id assigned by the store.
    pub id: String,

    /// Lexicographically smaller identity.
    #[serde(rename = "ID1")]
    pub low: Identity,

    /// Lexicographically larger identity.
    #[serde(rename = "ID2")]
    pub high: Identity,

    /// Bond flag written by the `low` identity's client.
    #[serde(rename = "Bonded1")]
    pub low_bonded: bool,

    /// Bond flag written by the `high` identity's client.
    #[serde(rename = "Bonded2")]
    pub high_bonded: bool,

    /// Advisory compatibility score in `[0, 1]`.
    #[serde(rename = "sim_score")]
    pub similarity_score: f64,

    /// Accumulated minutes spent together while mutually bonded.
    #[serde(rename = "totalTimeMinutes")]
    pub total_together_minutes: u64,

    /// When the last minute was accumulated.
    #[serde(rename = "lastSeen")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PairRecord {
    /// The canonical key for this record.
    #[must_use]
    pub fn key(&self) -> PairKey {
        PairKey {
            low: self.low.clone(),
            high: self.high.clone(),
        }
    }

    /// The bond flag for `side`.
    #[must_use]
    pub const fn flag(&self, side: Side) -> bool {
        match side {
            Side::Low => self.low_bonded,
            Side::High => self.high_bonded,
        }
    }

    /// The side `identity` occupies in this record.
    #[must_use]
    pub fn side_of(&self, identity: &Identity) -> Option<Side> {
        self.key().side_of(identity)
    }

    /// Both sides have bonded.
    #[must_use]
    pub const fn is_mutual(&self) -> bool {
        self.low_bonded && self.high_bonded
    }
}

/// One document per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IdentityRecord {
    /// Document id assigned by the store.
    pub id: String,

    /// The user's identity.
    #[serde(rename = "username")]
    pub identity: Identity,

    /// Contact address, presentation only.
    #[serde(default)]
    pub email: String,

    /// Identities that requested a bond and await reciprocation.
    #[serde(default)]
    pub incoming: BTreeSet<Identity>,

    /// Identities with a live mutual bond.
    #[serde(default)]
    pub bonded: BTreeSet<Identity>,
}

/// A bonded peer joined with its pair's accumulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BondedPeer {
    /// The bonded peer.
    pub identity: Identity,
    /// Minutes accumulated together.
    pub total_together_minutes: u64,
    /// Advisory similarity score of the pair.
    pub similarity_score: f64,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Identity this device is signed in as.
    #[schema(example = "alice")]
    pub identity: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_identity_is_normalized() {
        assert_eq!(id("  Alice ").as_str(), "alice");
    }

    #[test]
    fn test_identity_rejects_bad_input() {
        assert_eq!(Identity::parse("   "), Err(IdentityError::Empty));
        assert!(matches!(
            Identity::parse("al ice"),
            Err(IdentityError::InvalidCharacters(_))
        ));
        let long = "a".repeat(MAX_IDENTITY_LENGTH + 1);
        assert!(matches!(
            Identity::parse(&long),
            Err(IdentityError::TooLong { .. })
        ));
    }

    #[test]
    fn test_pair_key_is_symmetric() {
        let ab = PairKey::canonical(&id("bob"), &id("alice")).unwrap();
        let ba = PairKey::canonical(&id("alice"), &id("bob")).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.low().as_str(), "alice");
        assert_eq!(ab.high().as_str(), "bob");
        assert_eq!(ab.side_of(&id("bob")), Some(Side::High));
        assert_eq!(ab.side_of(&id("carol")), None);
    }

    #[test]
    fn test_pair_key_rejects_self_pair() {
        assert!(PairKey::canonical(&id("alice"), &id("alice")).is_none());
    }

    #[test]
    fn test_pair_record_uses_store_field_names() {
        let record = PairRecord {
            id: "p1".into(),
            low: id("alice"),
            high: id("bob"),
            low_bonded: true,
            high_bonded: false,
            similarity_score: 0.5,
            total_together_minutes: 3,
            last_seen_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ID1"], "alice");
        assert_eq!(json["Bonded1"], true);
        assert_eq!(json["totalTimeMinutes"], 3);
        assert!(!record.is_mutual());
    }

    #[test]
    fn test_identity_record_deserializes_lists() {
        let json = r#"{"id":"u1","username":"bob","email":"b@x","incoming":["alice"],"bonded":[]}"#;
        let record: IdentityRecord = serde_json::from_str(json).unwrap();
        assert!(record.incoming.contains(&id("alice")));
        assert!(record.bonded.is_empty());
    }
}
