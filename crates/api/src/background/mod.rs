//! Long-running background tasks spawned by the binary.

pub mod cache_sweep;
