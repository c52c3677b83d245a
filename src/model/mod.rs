//! Core data model types: locations, handles, summary fields and addresses.

pub mod address;
pub mod field;
pub mod mail;
