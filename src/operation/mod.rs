//! Operation tracking - registry of long-running, cancellable export jobs

pub mod registry;
pub mod types;

pub use registry::{OperationRegistry, ReaperHandle};
pub use types::{keys, Operation, OperationId, OperationStatus, Progress, ProgressReport};
