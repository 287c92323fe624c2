//! The `utils` module provides shared definitions used across `chatcast`:
//! the error taxonomy and logging bootstrap.

pub mod error;
pub mod logging;
