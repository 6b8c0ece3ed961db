//! Process isolation for providers
//!
//! Provider libraries read credentials from process-wide environment
//! variables, so each configured instance runs in its own worker process
//! (this same executable, re-invoked in worker mode) and is reached over a
//! private stdin/stdout channel.

pub mod process;
pub mod protocol;
pub mod worker;

pub use process::{Closer, ProcessOptions, ProviderProcess};
pub use protocol::{PROTOCOL_VERSION, WORKER_ARG};
pub use worker::worker_invocation;
