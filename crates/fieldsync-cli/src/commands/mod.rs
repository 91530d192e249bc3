//! Command handlers

pub mod config;
pub mod network;
pub mod pending;
pub mod record;
pub mod status;
pub mod sync;
