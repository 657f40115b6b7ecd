//! Image management
//!
//! Registry credentials and the serialized image pull queue.

pub mod pull;
pub mod registry;

pub use pull::{LayerProgress, PullHandle, PullQueue, PullStatus, PullTask, PullTicket, QueueSnapshot};
pub use registry::{normalize_tag, RegistryAuth, RegistryToken, StaticTokenProvider, TokenProvider};
