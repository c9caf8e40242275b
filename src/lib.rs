//! # Wayfinder API Client
//!
//! A typed client for the Wayfinder resource-oriented API with:
//! - Profile-based configuration (file-backed or from the environment)
//! - Transparent identity refresh and access-token exchange
//! - Rate-limit aware transport with backoff
//! - Structured validation, conflict and dependency errors
//! - A controller-runtime style typed object layer with safe retry of
//!   status-only write conflicts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wayfinder_client::client::Client;
//! use wayfinder_client::config::Config;
//! use wayfinder_client::object::{ObjectClient, ObjectKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env_or_file()?;
//!     let client = Client::new(config);
//!
//!     let mut req = client.request().await;
//!     let who: serde_json::Value = req.endpoint("/whoami").get().await.json()?;
//!     println!("{}", who);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod validation;

// Authentication
pub mod auth;
pub mod jwt;

// Transport
pub mod request;
pub mod retry;
pub mod url;

// Client surfaces
pub mod client;
pub mod object;

// Re-exports for convenience
pub use client::{Client, ClientBuilder, UpdateHandler};
pub use config::Config;
pub use errors::{ApiError, Error, Result};
pub use object::{Object, ObjectClient, ObjectKey, ObjectList, ResourceDescriptor};
pub use request::{Dispatcher, Parameter, Request, WarningHandler};
pub use validation::{ValidationError, Warning};
