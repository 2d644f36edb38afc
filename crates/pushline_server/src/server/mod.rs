#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod http;
pub mod message_log;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod send;
pub mod state;
