//! # cxapi
//!
//! Typed client for the contact-center platform API.
//!
//! The API surface is split by area ([`UsersApi`], [`RoutingApi`],
//! [`DirectoryApi`], [`TeamsApi`], [`GrammarsApi`]) and gathered under
//! [`PlatformApi`]. Two implementations are provided:
//!
//! - [`HttpBackend`]: blocking HTTP against a region's API base
//! - [`MemoryBackend`]: in-memory simulation with read lag, tombstones and
//!   failure injection
//!
//! ## Example
//!
//! ```ignore
//! use cxapi::{HttpBackend, UsersApi};
//! use std::time::Duration;
//!
//! let api = HttpBackend::new("https://api.mypurecloud.com", token, Duration::from_secs(60));
//! let user = api.get_user("c5b6d3a0-...")?;
//! ```

pub mod backend;
pub mod models;

pub use backend::http::{DEFAULT_API_BASE, HttpBackend};
pub use backend::memory::{HOME_DIVISION_ID, MemoryBackend};
pub use backend::{
    ApiResult, DirectoryApi, GrammarsApi, PlatformApi, RoutingApi, TeamsApi, UsersApi,
};
pub use models::*;
