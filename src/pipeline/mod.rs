pub mod build;
pub mod definition;
pub mod deploy;
pub mod error;
pub mod jobbuilder;
pub mod registry;
pub mod stage;
pub mod user;

/// Nanosecond wall-clock timestamp used on build and stage records.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}
