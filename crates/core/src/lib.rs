//! Core business logic for the Nimbus storage engine (§4).

pub mod services;

pub use services::*;
