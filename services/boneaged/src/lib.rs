//! Bone-age assessment HTTP server: static assets and a batched inference
//! endpoint served from a multi-reactor TCP engine.

#![allow(clippy::new_without_default)]

pub mod app;
pub mod config;
pub mod inference;
pub mod middleware;
pub mod static_files;
