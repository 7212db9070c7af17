//! Mercado Lister Core - Shared domain types.
//!
//! This crate holds the types shared by the server, the CLI and the
//! integration tests:
//! - `server` - HTTP API, MercadoLibre OAuth integration and refresh scheduler
//! - `cli` - Migrations and operational commands
//!
//! The core crate contains only types - no I/O, no database access,
//! no HTTP clients. Database encoding is available behind the `postgres`
//! feature.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
