//! Hostgate - a host-based HTTP gateway
//!
//! This library provides a front-end server that:
//! - Routes HTTP traffic by Host header (and its subdomains) to configured backends
//! - Reverse-proxies to upstream servers over plain HTTP with connection pooling
//! - Serves static directories with listings, conditional GETs and MIME detection
//! - Reloads its route file in the background without dropping requests
//! - Terminates TLS with per-host certificates picked by SNI

pub mod config;
pub mod error;
pub mod listener;
pub mod loader;
pub mod pool;
pub mod proxy;
pub mod reloader;
pub mod route;
pub mod static_files;
pub mod table;
pub mod tls;
