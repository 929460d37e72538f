//! Voltage Communication Link Library
//!
//! Protocol-agnostic building blocks shared by device links.
//!
//! # Architecture
//!
//! This library provides:
//! - **Errors**: `ComLinkError`, the taxonomy every link operation reports through
//! - **State**: `ConnectionState` lifecycle and the queryable `LinkStatus` snapshot
//! - **Values**: `ProtocolValue` / `DecodedValue`, the decoded output of a read
//! - **Logging**: `ChannelLogger`, device-tagged `tracing` output

pub mod error;
pub mod logger;
pub mod state;
pub mod value;

pub use error::{exception_description, ComLinkError, Result};
pub use logger::ChannelLogger;
pub use state::{ConnectionState, LinkStatus, StateChange};
pub use value::{DecodedValue, ProtocolValue};
