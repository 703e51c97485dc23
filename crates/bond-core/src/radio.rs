//! Radio backends for [`crate::beacon::BeaconRadio`].
//!
//! - [`bluez`] - BlueZ over D-Bus via `bluer` (Linux, `bluetooth` feature)
//! - [`mock`] - an in-process shared medium for tests and radio-less builds

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod mock;

#[cfg(feature = "bluetooth")]
pub use bluez::BluezRadio;
pub use mock::{MockAir, MockRadio};
