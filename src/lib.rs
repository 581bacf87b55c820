//! Windowed media browsing engine with host/guest sync.
//!
//! A [`navigation::NavigationController`] pages through a category from the
//! media server and keeps a small window of materialized media around the
//! current item, backed by a priority-evicting [`cache::MediaCache`] and a
//! background [`preload::PreloadScheduler`]. A [`sync::SyncCoordinator`]
//! replicates the host's position to guests over the realtime channel.

pub mod api;
pub mod backend;
pub mod backoff;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexing;
pub mod media;
pub mod navigation;
pub mod preload;
pub mod realtime;
pub mod renderer;
pub mod resource;
pub mod sync;

pub use error::{Error, Result};

#[cfg(test)]
mod test_support;
