//! A STOMP/TLS relay: bridges a local message broker to a single
//! settlement peer node over a mutually-authenticated STOMP 1.2
//! connection.
//!
//! Module layout follows the teacher crate's split between wire
//! protocol (`frame`, `queue`, `protocol`), transport security (`tls`),
//! and application glue (`directory`, `broker`, `translate`, `relay`).

pub mod async_runtime;
pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod subnet;
pub mod tls;
pub mod translate;
