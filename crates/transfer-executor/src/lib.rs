//! Transfer executor boundary.
//!
//! The orchestration engine decides *what* to move and *when*; implementations
//! of [`TransferExecutor`] do the moving. Protocol knowledge is confined to
//! [`EndpointKind`] so the engine never has to branch on it.

pub mod error;
pub mod location;
pub mod rclone;
pub mod traits;

pub use error::{ExecutorError, Result};
pub use location::{EndpointKind, Location, join};
pub use rclone::RcloneExecutor;
pub use traits::{
    ExecutorEvent, ExecutorFlags, ExecutorStream, ProgressEvent, RemoteFile, TransferExecutor,
    TransferRequest, TransferSummary, drive,
};
