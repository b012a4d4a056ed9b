//! previewd - per-branch preview environment provisioning
//!
//! This library provides the provisioning core of a preview-environment
//! service:
//! - Keeps a pool of ports per host IP and hands out the lowest free one
//! - Records which branch owns which IP and port
//! - Renders one reverse-proxy config per branch and reloads the proxy
//! - Releases ports and removes configs when a branch is deleted
//! - Exposes create/delete over a small JSON HTTP API

pub mod allocator;
pub mod api;
pub mod config;
pub mod error;
pub mod identifier;
pub mod lifecycle;
pub mod locks;
pub mod pool;
pub mod registry;
pub mod renderer;
pub mod store;
