//! Adaptive content cache for publishing sites.
//!
//! [`cache`] holds the subsystem itself; [`config`] and [`infra`] wire it
//! into a process, and [`domain`] carries the content snapshots it caches.

pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
