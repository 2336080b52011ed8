// VPN Session Library
// Shared modules for the daemon and tests

#![warn(missing_docs)]

//! VPN session lifecycle library
//!
//! Brings up and tears down a single VPN session: provisions a tunnel
//! interface, starts an external tunnel engine on it, and reports state,
//! traffic and errors to one UI subscriber.
//!
//! # Main Components
//!
//! - [`controller`]: Running flag, worker task, rollback and teardown
//! - [`state`]: Pure state machine for the session lifecycle
//! - [`event_bus`]: Single-subscriber event publication
//! - [`commands`] / [`control`]: Command surface and its Unix socket transport
//! - [`provisioner`] / [`tun_provisioner`]: Tunnel interface contract and Linux implementation
//! - [`tunnel_core`] / [`process_core`]: Tunnel engine contract and process-based engine
//! - [`platform`]: Capabilities offered to the engine (socket protection, interfaces)
//! - [`surface`], [`notifier`], [`state_file`]: Indicators shown while connected
//! - [`config`] / [`types`]: Configuration and shared data structures

pub mod commands;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod event_bus;
pub mod notifier;
pub mod platform;
pub mod process_core;
pub mod provisioner;
pub mod state;
pub mod state_file;
pub mod surface;
pub mod tun_provisioner;
pub mod tunnel_core;
pub mod types;
