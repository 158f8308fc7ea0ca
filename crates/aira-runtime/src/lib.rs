//! Container and workspace plumbing for agent sessions.
//!
//! [`ContainerRuntime`] is the seam everything else is written against;
//! [`DockerRuntime`] implements it over the Docker Engine API and
//! [`GitWorkspace`] builds isolated per-session working trees on top of it.

pub mod config;
pub mod container;
pub mod docker;
pub mod error;
pub mod limits;
pub mod workspace;

pub use config::RuntimeConfig;
pub use container::{ContainerRuntime, CreateOptions, LogStream};
pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use limits::{ResourceLimits, parse_cpu_limit, parse_memory_limit};
pub use workspace::{GitWorkspace, WorkspaceManager};
