//! # proxlb
//!
//! Workload rebalancer for Proxmox VE clusters. Each cycle reads the
//! cluster through the REST API, compiles tag- and pool-derived placement
//! rules, computes a plan that equalizes node load on one dimension, and
//! executes the resulting migrations.
//!
//! ## Subsystems
//!
//! - [`api`] — authenticated REST client behind the [`api::ProxmoxApi`] seam
//! - [`inventory`] — canonical, immutable per-cycle cluster snapshot
//! - [`constraints`] — affinity / anti-affinity / pin / ignore compilation
//! - [`engine`] — pure placement engine producing a [`engine::plan::Plan`]
//! - [`executor`] — sequential or bounded-parallel migration driver
//! - [`scheduler`] — one-shot and daemon orchestration, signals, reload
//! - [`cli`], [`config`] — the operator surface

pub mod api;
pub mod cli;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod executor;
pub mod inventory;
pub mod scheduler;
