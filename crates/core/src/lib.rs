pub mod compiler;
pub mod config;
pub mod error;
pub mod job;
pub mod wire;

pub use compiler::{panic_message, CompileOutput, Compiler, DigestCompiler};
pub use error::KilnError;
pub use job::{GroupId, Job, JobId, WorkerTypeKey};
pub use wire::{BatchRequest, BatchResponse, RequestEntry, ResponseEntry};
