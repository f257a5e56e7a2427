//! Process-isolated job execution.
//!
//! Riskier or heavier work runs in a child process with its own address
//! space, so a hang or crash never takes the application down and
//! cancellation can be enforced by termination. Parent and child share no
//! memory; the child posts [`envelope::IpcEnvelope`] messages on stdout (one
//! JSON object per line) and free-form log output on stderr. The only
//! parent-to-child signal is process termination.

pub mod envelope;
pub mod runner;
pub mod writer;

pub use envelope::{parse_envelope, IpcEnvelope};
pub use runner::{ProcessJobRunner, ProcessJobSpec};
pub use writer::EnvelopeWriter;
