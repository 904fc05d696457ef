//! Common utilities and types shared across the conference crates.

#![warn(clippy::pedantic)]

/// Module for identifier types shared by the service and its test utilities
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
