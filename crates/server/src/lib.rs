//! Mercado Lister API server library.
//!
//! Local accounts plus the MercadoLibre integration: OAuth 2.0 with PKCE,
//! encrypted token storage, automatic refresh and the category endpoints
//! used while drafting listings.
//!
//! Exposed as a library so the CLI and integration tests can reuse it.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod mercadolibre;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
