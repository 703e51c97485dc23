//! Unified error types for the bond core library.
//!
//! This module provides a unified error type [`BondError`] that covers all failure
//! modes across the bond system. Each module also has its own specific error types
//! (`BeaconError`, `StoreError`, `AccumulateError`, `SimilarityError`,
//! `ConfigError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use bond_core::error::{BondError, Result};
//! use bond_core::Identity;
//!
//! fn parse(raw: &str) -> Result<Identity> {
//!     Ok(Identity::parse(raw)?)
//! }
//!
//! assert!(matches!(parse("no spaces"), Err(BondError::InvalidIdentity(_))));
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all bond operations.
#[derive(Debug, Error)]
pub enum BondError {
    // =========================================================================
    // BEACON ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    BluetoothAdapterPoweredOff,

    /// The process may not use the radio.
    #[error("Bluetooth permission denied: {0}")]
    BluetoothPermissionDenied(String),

    /// The radio refused to advertise.
    #[error("Bluetooth advertising failed: {0}")]
    AdvertiseFailed(String),

    /// The radio refused to scan.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    // =========================================================================
    // RELATIONSHIP ERRORS
    // =========================================================================
    /// An identity string failed validation.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// A pair was requested between an identity and itself.
    #[error("Cannot bond with yourself ('{0}')")]
    SelfPair(String),

    /// No identity record exists.
    #[error("Unknown identity: '{0}'. The user must sign in at least once.")]
    UnknownIdentity(String),

    /// No pair record exists.
    #[error("No relationship found: {0}")]
    PairNotFound(String),

    /// Time only accumulates for mutual bonds.
    #[error("Not mutually bonded with '{0}'")]
    NotMutuallyBonded(String),

    /// A stored record is inconsistent or undecodable.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// The document store could not be reached.
    #[error("Document store unavailable: {0}. Retry on the next detection.")]
    StoreUnavailable(String),

    // =========================================================================
    // SIMILARITY ERRORS
    // =========================================================================
    /// The similarity endpoint failed or is not configured.
    #[error("Similarity service unavailable: {0}")]
    SimilarityUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for bond operations.
pub type Result<T> = std::result::Result<T, BondError>;

impl BondError {
    /// Returns `true` if this error is related to the radio.
    #[inline]
    #[must_use]
    pub const fn is_beacon_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::BluetoothAdapterPoweredOff
                | Self::BluetoothPermissionDenied(_)
                | Self::AdvertiseFailed(_)
                | Self::ScanFailed(_)
        )
    }

    /// Returns `true` if this error came from the relationship store.
    #[inline]
    #[must_use]
    pub const fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::SelfPair(_)
                | Self::UnknownIdentity(_)
                | Self::PairNotFound(_)
                | Self::NotMutuallyBonded(_)
                | Self::CorruptRecord(_)
                | Self::StoreUnavailable(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if this error represents an expected operational state.
    ///
    /// Gated accumulation and missing pairs are normal while peers are only
    /// nearby and not yet bonded.
    #[inline]
    #[must_use]
    pub const fn is_expected_state(&self) -> bool {
        matches!(self, Self::NotMutuallyBonded(_) | Self::PairNotFound(_))
    }

    /// Returns `true` if retrying on the next natural trigger may succeed.
    #[inline]
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::PersistenceError(_)
                | Self::SimilarityUnavailable(_)
                | Self::AdvertiseFailed(_)
                | Self::ScanFailed(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidIdentity(_) | Self::SelfPair(_) => 400,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::UnknownIdentity(_) | Self::PairNotFound(_) => 404,

            // 409 Conflict - valid request, wrong relationship state
            Self::NotMutuallyBonded(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::CorruptRecord(_) | Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - upstream service failed
            Self::SimilarityUnavailable(_) => 502,

            // 503 Service Unavailable - radio or store unreachable
            Self::BluetoothAdapterNotFound
            | Self::BluetoothAdapterPoweredOff
            | Self::BluetoothPermissionDenied(_)
            | Self::AdvertiseFailed(_)
            | Self::ScanFailed(_)
            | Self::StoreUnavailable(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::BluetoothPermissionDenied(_) => "BLUETOOTH_PERMISSION_DENIED",
            Self::AdvertiseFailed(_) => "ADVERTISE_FAILED",
            Self::ScanFailed(_) => "SCAN_FAILED",
            Self::InvalidIdentity(_) => "INVALID_IDENTITY",
            Self::SelfPair(_) => "SELF_PAIR",
            Self::UnknownIdentity(_) => "UNKNOWN_IDENTITY",
            Self::PairNotFound(_) => "PAIR_NOT_FOUND",
            Self::NotMutuallyBonded(_) => "NOT_MUTUALLY_BONDED",
            Self::CorruptRecord(_) => "CORRUPT_RECORD",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::SimilarityUnavailable(_) => "SIMILARITY_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BondError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            e @ ConfigError::ValidationError { .. } => Self::ConfigValidationError(e.to_string()),
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::beacon::BeaconError> for BondError {
    fn from(err: crate::beacon::BeaconError) -> Self {
        use crate::beacon::BeaconError;
        match err {
            BeaconError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            BeaconError::AdapterPoweredOff => Self::BluetoothAdapterPoweredOff,
            BeaconError::PermissionDenied { message } => Self::BluetoothPermissionDenied(message),
            BeaconError::AdvertiseFailed { message } => Self::AdvertiseFailed(message),
            BeaconError::ScanFailed { message } => Self::ScanFailed(message),
        }
    }
}

impl From<crate::types::IdentityError> for BondError {
    fn from(err: crate::types::IdentityError) -> Self {
        Self::InvalidIdentity(err.to_string())
    }
}

impl From<crate::store::StoreError> for BondError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::SelfPair(identity) => Self::SelfPair(identity.to_string()),
            StoreError::UnknownIdentity(identity) => Self::UnknownIdentity(identity.to_string()),
            StoreError::UnknownPair(id) => Self::PairNotFound(format!("pair document {id}")),
            e @ StoreError::NotAMember { .. } => Self::CorruptRecord(e.to_string()),
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            StoreError::Persistence { path, source } => {
                Self::PersistenceError(format!("Failed to persist {path}: {source}"))
            }
            StoreError::Corrupt(e) => Self::CorruptRecord(e.to_string()),
        }
    }
}

impl From<crate::accumulator::AccumulateError> for BondError {
    fn from(err: crate::accumulator::AccumulateError) -> Self {
        use crate::accumulator::AccumulateError;
        match err {
            AccumulateError::NoPair { peer } => Self::PairNotFound(format!("with '{peer}'")),
            AccumulateError::NotMutuallyBonded { peer } => {
                Self::NotMutuallyBonded(peer.to_string())
            }
            AccumulateError::Store(e) => e.into(),
        }
    }
}

impl From<crate::similarity::SimilarityError> for BondError {
    fn from(err: crate::similarity::SimilarityError) -> Self {
        Self::SimilarityUnavailable(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
