//! Proxmox REST API access
//!
//! - [`endpoint`] parses the `host[:port]` endpoint grammar
//! - [`types`] holds the wire DTOs and numeric coercion
//! - [`client`] implements the authenticated client behind the
//!   [`ProxmoxApi`] trait, which is the seam tests mock

pub mod client;
pub mod endpoint;
pub mod types;

pub use client::{ApiError, GuestListing, ProxmoxApi, ProxmoxClient};
pub use endpoint::{Endpoint, EndpointError};
pub use types::{
    ApiGuest, ApiNode, GuestConfig, HaStatusEntry, MigrateOptions, RrdSample, TaskRef,
    TaskStatusInfo, Upid, VersionInfo,
};
