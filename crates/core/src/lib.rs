//! CityPulse core: sensor reading model and the synchronous in-memory engine.
//!
//! - [`normalizer`] turns raw producer payloads into [`Reading`]s.
//! - [`store::StreamStore`] keeps a bounded ring of recent readings per sensor.
//! - [`aggregator`] derives windowed statistics from store snapshots.
//! - [`alert::AlertEngine`] evaluates threshold rules per reading and
//!   [`alert_log::AlertLog`] keeps the most recent alerts.
//! - [`cache::TtlCache`] memoizes expensive queries for a short TTL.
//!
//! Nothing in this crate performs I/O or depends on an async runtime.

pub mod aggregator;
pub mod alert;
pub mod alert_log;
pub mod cache;
pub mod error;
pub mod normalizer;
pub mod reading;
pub mod ring;
pub mod store;
pub mod types;

pub use alert::{Alert, AlertEngine, AlertKind, Severity};
pub use alert_log::AlertLog;
pub use error::{CoreError, NormalizationError};
pub use reading::{Reading, StreamKind};
pub use store::StreamStore;
