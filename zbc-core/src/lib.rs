//! Core types and wire protocol for the Zeebe broker client.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;

pub use error::{DecodeError, Result, ZbcError};
