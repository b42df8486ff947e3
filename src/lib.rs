//! vproc - Local process orchestrator
//!
//! Starts named processes from templates, hands each one the resources it
//! needs (ports, sockets, files) without collisions, and finds processes it
//! did not start so they can be adopted after a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │          vprocctl ──(unix socket)──► vprocd        │
//! ├──────────────────────────────────────────────────┤
//! │                    Manager                        │
//! │   lifecycle   │  discovery/reconcile  │  watchers │
//! ├──────────────────────────────────────────────────┤
//! │ ResourceTable │       procfs          │   Store   │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod manager;
pub mod procfs;
pub mod protocol;
pub mod resources;
pub mod store;

pub use config::Config;
pub use manager::{Instance, InstanceStatus, Manager, ManagerError, Template};
