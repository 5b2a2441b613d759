//! Quotaguard - Outbound Call Admission Control
//!
//! This crate implements an in-process rate limiter that callers consult before
//! making a request to an external identity, calendar or notification provider.
//! Each (provider, caller key) pair gets its own sliding window with an optional
//! burst sub-window, and the limiter fails open if its own bookkeeping breaks.

pub mod config;
pub mod error;
pub mod ratelimit;
