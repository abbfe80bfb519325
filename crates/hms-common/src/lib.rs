//! HMS Common - shared primitives for the billing engine
//!
//! This crate provides:
//! - Error taxonomy (`Validation`, `NotFound`, `Conflict`, `Internal`)
//! - Persistence error type for store ports
//! - Clock and identifier ports
//! - Money rounding

#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod clock;
pub mod error;
pub mod money;

pub use clock::*;
pub use error::*;
pub use money::*;
