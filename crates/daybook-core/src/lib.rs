//! # Daybook Core
//!
//! Shared foundations for the Daybook journaling service: configuration,
//! the error taxonomy, entry types, and the injected clock.
//!
//! Nothing in this crate talks to the network or the database — it exists so
//! the engine, the channels, and the binary agree on types without cyclic
//! dependencies.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::DaybookConfig;
pub use error::{DaybookError, Result};
pub use types::{Entry, EntryType, User};
