//! Database access layer (sqlx/SQLite), one module per table

pub mod catalog;
pub mod email_queue;
pub mod error_logs;
pub mod order_items;
pub mod orders;
pub mod retry_logs;
pub mod users;

/// Current time in unix epoch milliseconds (the crate-wide timestamp unit)
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
