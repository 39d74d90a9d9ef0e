//! Core domain types and logic.

pub mod cache_key;
pub mod calendar;
pub mod config_validation;
pub mod dataset;
pub mod datasets;
pub mod error;
pub mod frame;
pub mod object_id;
pub mod range;
