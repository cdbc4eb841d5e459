//! Wardline - inpatient bed/ward occupancy engine and medication stock ledger
//!
//! - Ward capacity with bed records kept in step and a capacity ledger
//! - Admission, transfer and discharge as single units of work under ordered locks
//! - Append-only stock ledger with minimum/maximum flags
//! - In-memory and PostgreSQL backends behind one store trait

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod request_context;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
