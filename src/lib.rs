//! `msgstore`: durable message storage for mail clients.
//!
//! This crate stores raw RFC 5322 messages in one of two on-disk layouts,
//! keeps a compact index record per message, and serves summary fields
//! through LRU caches:
//!
//! - [`blob`]: cluster-addressed blob files with an allocation bitmap.
//! - [`store`]: the single-file and multi-file message stores.
//! - [`index`] / [`cache`]: raw and decoded summary fields.
//! - [`account`] / [`folder`]: message handles and their persistence.

pub mod account;
pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod folder;
pub mod index;
pub mod lru;
pub mod model;
pub mod parser;
pub mod store;
