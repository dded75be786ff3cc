//! HTTP API Module
//!
//! Transport adapter between HTTP clients and the replication dispatcher.

mod http;

pub use http::{status_for, HttpServer};
