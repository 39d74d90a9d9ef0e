//! Port traits for the external collaborators.

pub mod clock_port;
pub mod config_port;
pub mod registry_port;
pub mod source_port;
