//! CityPulse hub server library.
//!
//! Wires the core engine and the broadcaster into an ingestion pipeline, a
//! cached query surface, scheduled producers, and the WebSocket push
//! gateway. Exposed as a library so integration tests and the binary
//! entrypoint share the same building blocks.

pub mod background;
pub mod config;
pub mod error;
pub mod ingest;
pub mod producer;
pub mod query;
pub mod reconnect;
pub mod routes;
pub mod state;
pub mod upstream;
pub mod ws;
