//! Upstream data source port.

use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::TimeRange;

pub trait SourcePort: Send + Sync {
    /// Rows of `table` dated inside `range`, ascending by date. `None` asks for
    /// the whole table as a version snapshot.
    ///
    /// Failures surface as [`TidemarkError::SourceUnavailable`].
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError>;

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError>;
}
