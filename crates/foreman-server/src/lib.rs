//! # Foreman Server Library
//!
//! TCP front end of the Foreman job broker: the accept loop, one task per
//! connection speaking the binary packet protocol or admin text lines,
//! and the application builder that wires configuration, persistence and
//! the job manager together.

pub mod admin;
pub mod app;
pub mod connection;
pub mod server;
pub mod startup;

pub use admin::{AdminCommand, AdminReply};
pub use app::{build_engine, App, AppBuilder};
pub use connection::{Connection, ConnectionSettings};
pub use server::BrokerServer;
