//! Application-level error types shared by the binary and the ops router.

pub mod error;
