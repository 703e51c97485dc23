//! # bond-server
//!
//! HTTP server library for bond, the proximity bonding system.
//!
//! This library provides the API handlers, logging setup and state
//! management around a [`bond_core::BondSession`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
