//! Core building blocks shared by every subsystem.
//!
//! Currently this is just the crate-wide error type ([`FeedError`]); the
//! subsystems themselves deliberately share no other state, so that a blocked
//! rate-limiter wait, an in-flight crumb refresh and streaming decode can all
//! proceed without touching a common lock.

pub mod error;

pub use error::FeedError;
