//! Larch: a document-database front end speaking the MongoDB wire protocol.
//!
//! The crate is the protocol-dispatch core: it accepts wire-protocol
//! connections, frames and validates messages, routes each request to a
//! command handler, optionally mirrors requests to an upstream reference
//! server with a logged diff, and presents storage through a small
//! contract-enforced abstraction.
//!
//! # Architecture
//!
//! ```text
//! listener ─ accept ─▶ connection runner (clientconn)
//!                            │
//!                 wire codec (wire / document)
//!                            │
//!                  command registry (command)
//!                            │
//!                    handler (handler) ──▶ storage contract (backend)
//!                            │
//!                       response ──▶ wire codec ──▶ client
//! ```
//!
//! In mirrored modes the runner also drives the proxy router (`proxy`) and
//! feeds both responses through a textual differ before answering.

#![warn(missing_docs)]

/// Storage contract and the bundled in-memory backend.
pub mod backend;
/// Per-connection runner, modes, recording, and the accept loop.
pub mod clientconn;
/// Process-wide command registry.
pub mod command;
/// Environment-driven server configuration.
pub mod config;
/// Ordered document model and its binary encoding.
pub mod document;
/// Protocol error taxonomy and its on-wire projection.
pub mod error;
/// The handler seam and the bundled backend-backed handler.
pub mod handler;
/// Request/response counters.
pub mod metrics;
/// Upstream proxy client for mirrored modes.
pub mod proxy;
/// Shared utilities: request-scoped resource closing.
pub mod util;
/// Wire codec: headers, bodies, framing.
pub mod wire;

pub use clientconn::run;
pub use clientconn::serve;
pub use clientconn::ConnOpts;
pub use clientconn::Mode;
pub use config::ServerConfig;
pub use handler::BackendHandler;
pub use handler::Handler;
