//! Error codes shared by the sync core.
//!
//! DESIGN
//! ======
//! Each module owns its own `thiserror` enum. This trait gives every one of
//! them a grepable `E_*` code so batch reports and logs can carry a stable
//! identifier next to the human-readable message.

/// Grepable error code and retryable flag for structured error reports.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
