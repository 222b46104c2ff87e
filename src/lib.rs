//! arbx library
//!
//! Core of the cross-venue spot-arbitrage engine, exposed for the binary
//! and the integration tests.

pub mod backtest;
pub mod config;
pub mod detector;
pub mod executor;
pub mod models;
pub mod premium;
pub mod router;
pub mod storage;
pub mod universe;
pub mod venues;
