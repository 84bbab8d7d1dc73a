pub mod backup;
pub mod cloud;
pub mod command;
pub mod dirlist;
pub mod docker;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod shutdown;

pub use backup::{Restic, SnapshotEngine};
pub use cloud::Rclone;
pub use dirlist::DirListManager;
pub use docker::{ComposeRuntime, StackController, StackRuntime, StackState};
pub use error::{ErrorKind, PipelineError};
pub use orchestrator::{Orchestrator, RunOutcome, RunStats};
