//! Berth - a compose-style orchestrator on the Docker Engine API
//!
//! Berth reads declarative project definitions (services, networks and
//! volumes) and reconciles a Docker engine to match them:
//!
//! - Translating definitions into exact Engine create payloads
//! - Change detection through a content hash label on every container
//! - A serialized image pull queue with progress reporting
//! - Sequential `up` / `down` processing of projects

pub mod compose;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;

pub use error::{BerthError, Result};
