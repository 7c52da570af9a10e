//! Resumable, duplicate-safe import of external job feeds
//!
//! A feed is reconciled into a target store one record at a time. Runs stop
//! on resource limits or an open circuit and continue later from a persisted
//! checkpoint; see [`streaming::StreamProcessor`] and [`services::Runtime`].

pub mod app;
pub mod domain;
pub mod engine;
pub mod events;
pub mod health;
pub mod io;
pub mod jobs;
pub mod prelude;
pub mod resilience;
pub mod services;
pub mod storage;
pub mod streaming;
