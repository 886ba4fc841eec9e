mod actors;
pub mod authz;
pub mod broadcaster;
pub mod cgroup;
pub mod config;
pub mod error;
mod events;
pub mod isolation;
pub mod types;

// re-export the job coord handle as if it is the job coordinator itself.
pub use actors::coordinator::JobCoordinatorHandle as JobCoordinator;
pub use events::JobStatus;
pub use isolation::init::INIT_MARKER;
