#[macro_use]
mod log_macros;

pub mod lifecycle;
pub mod reactor;
pub mod scheduler;
pub mod service;
pub mod tracing_init;
pub(crate) mod capture_task;
mod distribution;
mod publisher;
mod worker;

pub mod error;

pub use capture_task::CaptureHandle;
pub use distribution::RuleAgent;
pub use service::{PassThroughService, ServiceFailure, ServiceHandler};

#[cfg(test)]
mod tests;
