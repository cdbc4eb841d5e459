//! Request handlers for API endpoints
//!
//! Handlers only extract, call one service operation and serialize its result.

pub mod admin;
pub mod metrics;
pub mod occupancy;
pub mod reads;
