/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Stable identifier of a physical sensor, unique per stream kind.
pub type SensorId = String;

/// Monotonic alert identifier, unique for the lifetime of the process.
pub type AlertId = u64;
