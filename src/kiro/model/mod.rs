//! Kiro data models
//!
//! Contains all data type definitions for the Kiro API:
//! - `events`: Response event types
//! - `requests`: Request types
//! - `credentials`: OAuth credentials
//! - `token_refresh`: Token refresh
//! - `usage_limits`: Usage quota queries

pub mod credentials;
pub mod events;
pub mod requests;
pub mod token_refresh;
pub mod usage_limits;
