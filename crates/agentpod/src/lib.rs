//! agentpod: run AI coding-agent CLIs in containers without handing them the
//! host's credentials.
//!
//! - [`ssh_agent`] and [`gpg_agent`]: filtering agent proxies
//! - [`secrets`]: delivers API keys without exposing them on command lines
//! - [`session`]: container naming, create-or-attach and teardown
//! - [`backend`]: docker, podman, Rancher, OrbStack and Daytona drivers

pub mod allowlist;
pub mod backend;
pub mod config;
pub mod error;
pub mod gpg_agent;
pub mod proxy;
pub mod secrets;
pub mod session;
pub mod ssh_agent;
pub mod temp_registry;

pub use allowlist::AllowList;
pub use error::{PodError, PodResult};
pub use session::{ContainerSession, SessionConfig, SessionIdentity, SessionMode};
