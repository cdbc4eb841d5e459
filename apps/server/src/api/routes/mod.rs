//! Route tables

pub mod admin;
pub mod api;
pub mod metrics;
