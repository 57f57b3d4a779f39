//! Application start-up support
//!
//! This crate gathers the capabilities an application configures once when it starts:
//!
//! * [`logging`]: installs the process-wide `tracing` subscriber from a
//!   [`LogConfiguration`][logging::LogConfiguration].
//! * [`telemetry`]: an injectable [`TelemetryClient`][telemetry::TelemetryClient] that can be
//!   initialized once with a sink.
//! * [`tokens`]: OpenID Connect token lifecycle management, re-exported from
//!   [`initiator_tokens`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use initiator::{
//!     logging::LogConfiguration,
//!     telemetry::{forward_token_refreshes, TelemetryClient, TracingTelemetrySink},
//!     tokens::{provider::OidcClient, storage::InMemoryTokenStorage, TokenManager},
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let _logging = LogConfiguration::from_env()?.apply()?;
//!
//! let telemetry = TelemetryClient::new();
//! telemetry.initialize(Arc::new(TracingTelemetrySink), "user-1234").await;
//!
//! let manager = TokenManager::builder(
//!     Arc::new(InMemoryTokenStorage::new()),
//!     Arc::new(OidcClient::default()),
//! )
//! .build();
//!
//! forward_token_refreshes(manager.subscribe(), telemetry.clone());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod logging;
pub mod telemetry;

pub use initiator_tokens as tokens;
