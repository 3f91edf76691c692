// src/lib.rs
//! Real-time polling: poll lifecycle, a vote ledger that counts each user once
//! per poll, cached results, live fan-out of changes and an expiry sweeper.

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod poll;
pub mod rate_limit;
pub mod results;
pub mod routes;
pub mod services;
pub mod store;
pub mod sweeper;
pub mod ws;

pub use error::{ApiError, PollError};
pub use services::{PollService, ServiceSettings};
