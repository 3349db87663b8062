pub mod alert;
pub mod snapshot;

pub use alert::Alert;
pub use snapshot::{metric, Metrics, Observation, Snapshot};
