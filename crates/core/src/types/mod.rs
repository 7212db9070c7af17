//! Core types for Mercado Lister.

pub mod email;
pub mod id;
pub mod site;
pub mod status;

pub use email::{Email, EmailError};
pub use id::*;
pub use site::{MlSite, MlSiteError};
pub use status::*;
