pub mod capture;
pub mod distribution;
pub mod logging;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod types;
pub mod validate;
pub mod worker;

pub use capture::CaptureConfig;
pub use distribution::DistributionConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use node::{IdentityConfig, NodeConfig};
pub use scheduler::SchedulerConfig;
pub use server::ServerConfig;
pub use types::HumanDuration;
pub use worker::WorkerConfig;
