//! Chat Relay — answers user chat messages through a remote answering service.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod relay;
pub mod store;
