//! Change-detection poller: watches JSON data feeds, deduplicates entities by
//! stable key, evaluates threshold policies against the last snapshot and
//! forwards qualifying transitions to a chat sink.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod sources;
