//! ISP delinquent-customer sync library
//!
//! Pulls overdue receivables from the ERPs ISPs run (IXC, MK-Auth, SGP,
//! RadiusNet), turns them into canonical client records for the provider,
//! and soft-deletes imports that are no longer overdue upstream.
//!
//! # Modules
//!
//! - `api`: HTTP-layer components.
//! - `core`: Sync engine (normalizer, importer, reconciler, orchestrator).
//! - `integrations`: ERP connectors.
//! - `clock`: Time source abstraction.
//! - `config`: Configuration management.
//! - `connectors`: ERP connector trait, registry and implementations.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Postgres storage.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `importer`: Upsert of normalized records.
//! - `models`: Core data models.
//! - `normalizer`: Source field mapping and risk tiers.
//! - `policy`: Subscription gate for provider operations.
//! - `rate_limit`: Per-provider limiter for manual operations.
//! - `reconciler`: Removal of imports no longer overdue.
//! - `scheduler`: Daily auto-sync loop.
//! - `store`: Storage traits and the in-memory store.
//! - `sync_service`: Sync orchestration and status bookkeeping.

pub mod api;
pub mod core;
pub mod integrations;

// Re-export primary modules for shared use in tests and other binaries
pub mod clock;
pub mod config;
pub mod connectors;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod handlers;
pub mod importer;
pub mod models;
pub mod normalizer;
pub mod policy;
pub mod rate_limit;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod sync_service;
