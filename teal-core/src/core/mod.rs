//! Configuration, error taxonomy and request models

pub mod config;
pub mod errors;
pub mod models;
