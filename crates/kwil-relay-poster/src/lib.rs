//! Reward poster: moves finalized Kwil reward batches onto the destination
//! chain through the wallet's multi-signature flow.

pub mod config;
pub mod poster;

pub use config::RelayConfig;
pub use poster::{Poster, PosterConfig};
