//! Model management and backend job client for the PLAYE desktop app.

pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod utils;
