// file: src/gce/mod.rs
// version: 1.0.0
// guid: 0c4e8a2f-6d1b-4f93-b5a7-1e2f3a4b5c6d

//! Google Compute Engine publishing

pub mod auth;
pub mod client;
pub mod pipeline;

pub use auth::{GoogleAuth, ServiceAccountKey};
pub use client::GceClient;
pub use pipeline::{GcePipeline, GceTarget};
