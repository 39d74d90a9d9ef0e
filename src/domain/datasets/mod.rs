//! Concrete [`TrackedDataset`](crate::domain::dataset::TrackedDataset) implementations.

pub mod corporate_actions;
pub mod table_series;
