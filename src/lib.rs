//! Passport Buddy -- client-side request queue for the traveler social app.
//!
//! This crate provides the rate-limited, concurrency-capped, retrying
//! [`RequestQueue`] that backend calls (liking a post, for example) are
//! funneled through, plus the REST client and configuration around it.

pub mod client;
pub mod config;
pub mod error;
pub mod queue;

pub use client::{BackendClient, LikeStatus, Notice};
pub use config::{BuddyConfig, QueueConfig};
pub use error::{ErrorKind, OperationError, QueueError};
pub use queue::{Pending, QueueStats, RequestQueue};
