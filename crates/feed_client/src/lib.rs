//! [`RemoteFeed`] implementations for the feed engine.
//!
//! - [`HttpFeed`] talks JSON to the transactions API over reqwest.
//! - [`MemoryFeed`] keeps everything in process; it backs the offline mode of
//!   the CLI and lets the engine be exercised without a server.
//!
//! [`RemoteFeed`]: feed_engine::RemoteFeed
pub use error::ClientError;
pub use http::{Credentials, HttpFeed};
pub use memory::MemoryFeed;

mod convert;
mod error;
mod http;
mod memory;
