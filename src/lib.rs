//! tidemark: keeps date-indexed datasets fresh in a shared object registry.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`], and the long-running sync loop
//! in [`service`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod logging;
pub mod ports;
pub mod service;
