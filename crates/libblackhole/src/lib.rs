//!
//! Bridges the "blackhole" watch directories of media managers (Sonarr,
//! Radarr) to a debrid service: every `.torrent` / `.magnet` file dropped
//! into a watch directory is staged, submitted to the debrid API, and once
//! the finished content appears in the debrid filesystem mount, mirrored
//! into the manager's completed directory as a symlink tree.
//!
//! # Overview
//!
//! The main type to start off with is [`Daemon`]: construct it from an
//! [`AppConfig`] plus [`Secrets`] and call [`Daemon::run`]. Everything else
//! is plumbing it owns: the wait registry rendezvous between the two
//! watcher backends, the per-torrent state machine, the debouncer, and the
//! HTTP clients.

pub mod arr;
pub mod config;
pub mod daemon;
pub mod debounce;
pub mod debrid;
mod error;
pub mod info_hash;
pub mod magnet;
pub mod mount;
pub mod registry;
pub mod scan;
pub mod spawn_utils;
pub mod state_machine;
pub mod torrent_file;
pub mod watcher;

pub use config::{AppConfig, Secrets};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use info_hash::InfoHash;

#[cfg(test)]
mod tests;

/// The cargo version of libblackhole.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
