//! Tenement - a single-process multi-tenant HTTP host
//!
//! This library hosts many small tenant sites inside one process:
//! - Routes HTTP traffic to tenants by the leading Host header label
//! - Gives every tenant its own route table, stats, and lifecycle state
//! - Serves tenants in-process or over per-instance loopback listeners
//! - Renders templated splash pages with per-tenant style palettes
//! - Serves static files from an optional per-tenant document root
//! - Exposes an authenticated admin API for tenant status

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod forward;
pub mod instance;
pub mod registry;
pub mod stats;
pub mod template;
