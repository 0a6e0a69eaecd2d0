//! MSP ground-station link
//!
//! Talks the MultiWii Serial Protocol (v1) to a flight controller:
//! frames bytes, applies replies to a shared [`VehicleState`], retries
//! requests that go unanswered and tells observers what changed.
//!
//! ```text
//! Transport ──bytes──> MspLink ──> MspCodec ──> Dispatcher ──> VehicleState
//!     ^                   │                          │
//!     │                   │                          └──> RequestManager / Broadcaster
//!     └───── OutputQueue <┘
//! ```

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod flightlog;
pub mod link;
pub mod logging;
pub mod msp;
pub mod request;
pub mod runner;
pub mod sequence;
pub mod state;
pub mod stats;
pub mod transport;
pub mod vehicle;

pub use broadcast::{Broadcaster, Category, CategorySet, Listener, WeakListener};
pub use error::{LinkError, Result};
pub use link::{LinkOptions, MspLink};
pub use msp::{Command, MspCode};
pub use request::{Callback, RequestManager};
pub use state::VehicleState;
pub use vehicle::{FlightControl, Vehicle};
