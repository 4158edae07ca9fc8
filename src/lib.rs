//! Cloud Camera Bridge
//!
//! Bridges a vendor cloud camera account onto the local network: logs in
//! with password + TOTP, mirrors cloud-recorded clips into date-partitioned
//! local storage, and proxies live stream start/stop with an idle auto-stop.

pub mod catalog;
pub mod cloud_api;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod state;
pub mod stream_control;
pub mod totp;
pub mod web_api;
