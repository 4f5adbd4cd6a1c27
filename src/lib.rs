//! Gatehouse - API Gateway Admission Pipeline
//!
//! This crate implements the front door of an API gateway: every inbound
//! request is rate limited per client against a shared counter store,
//! measured, and recorded in a structured access log before and after it
//! reaches the downstream handler.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod server;
