//! Device-host inventory and test lifecycle service.
//!
//! `devices` and `runs` hold the two managers; `http` exposes them over axum.

pub mod clock;
pub mod config;
pub mod devices;
pub mod health;
pub mod http;
pub mod inventory;
pub mod models;
pub mod provisioner;
pub mod reconciler;
pub mod runs;
pub mod state;
