//! # Database Context MCP Server
//!
//! A Model Context Protocol (MCP) server that lets an assistant inspect and
//! query SQL databases.
//!
//! This crate provides:
//! - **Tools**: list and filter tables, describe schemas, execute queries
//! - **Per-call targets**: each call names its database through the
//!   environment (stdio) or its headers (HTTP)
//! - **Connection cache**: one live connection per target, closed by a
//!   background sweep once idle
//! - **Bounded results**: query output is cut to a character budget, with an
//!   optional spill of the full result set to disk
//!
//! ## Architecture
//!
//! A call resolves its [`request::RequestConfig`], borrows the cached
//! connection for that target from [`cache::ConnectionCache`], and streams
//! rows through [`formatter::ResultFormatter`].

pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod formatter;
pub mod handlers;
pub mod request;
pub mod schema;
pub mod server;
pub mod shutdown;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::{McpError, ServerError};
pub use server::DbContextServer;
