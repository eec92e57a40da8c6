//! Installer agent and its control protocol.
//!
//! The agent runs on every node and performs installation work on request
//! of the coordinator. [`AgentService`] holds the session logic,
//! [`server`] exposes it over HTTP and [`AgentClient`] is the coordinator's
//! side of the connection.

pub mod client;
pub mod config;
pub mod error;
pub mod installer;
pub mod server;
pub mod service;

pub use client::{AgentClient, ExecuteStream};
pub use config::{AgentConfig, DEFAULT_AGENT_PORT};
pub use error::{AgentError, Result};
pub use installer::{CommandInstaller, Installer, ProgressSender};
pub use server::{create_router, serve, AgentIdentity};
pub use service::{AgentService, SessionStream};
