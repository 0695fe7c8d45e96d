#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate provides a client for JBD smart BMS (Battery Management System) devices that
//! report telemetry over Bluetooth Low Energy.
//!
//! Responses arrive as short notifications that are joined back into frames, decoded into
//! [`protocol::BatteryInfo`] and [`protocol::CellVoltages`], and combined into one
//! [`sequencer::Reading`] per polling cycle. A [`session::Session`] owns all of that state and
//! also keeps a running watt-hour total.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jbdbms`
//!   command-line tool.
//! - `ble`: Enables the Bluetooth transport using the `bluest` crate.
//! - `bin-dependencies`: Enables all features required by the `jbdbms` binary executable.
//!
//! The protocol, reassembly and polling logic do not depend on any transport; implement
//! [`session::Transport`] and feed notifications to [`session::Session::run`] to use another
//! link.

/// Contains error types for the library.
mod error;
/// Watt-hour integration of power samples.
pub mod energy;
/// Defines the frame format and the decoders for JBD BMS responses.
pub mod protocol;
pub mod reassembler;
pub mod sequencer;
pub mod session;

pub use error::{Error, Result};

/// Bluetooth Low Energy transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
