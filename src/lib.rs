//! `hm05`: a command-line programmer for the hm05 parallel NOR flash
//! cartridge, driven over a USB-to-MPSSE bridge.
//!
//! Data flow: CLI → Controller → ROM Engine → Flash Command Layer →
//! Flash Transport → MPSSE Engine → Framed Writer/Reader → Transport
//! Adapter → USB bridge ↔ flash chip. Each stage is its own module,
//! generic over the [`transport::Bridge`] trait so the full stack runs
//! against a software [`transport::mock::MockBridge`] in tests.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod bitrev;
pub mod cli;
pub mod error;
pub mod flash_commands;
pub mod flash_transport;
pub mod framed_io;
pub mod mpsse;
pub mod rom;
pub mod transport;

pub use crate::error::Error;
