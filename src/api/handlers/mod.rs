//! HTTP request handlers.

pub mod health;
pub mod labs;
pub mod vms;
