//! Object upload and transfer service.
//!
//! Validates, names and streams files into an object store bucket, switching
//! to concurrent multipart uploads for large objects, and serves them back
//! through listing, download, delete and zip bundling.

pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
