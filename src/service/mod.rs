//! Application services: the sync loop, the publisher it drives, and the
//! consumer-side client.

pub mod client;
pub mod publisher;
pub mod stop;
pub mod sync;
