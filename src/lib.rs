//! Music acquisition: resolve tracks and releases on a source service,
//! download them, tag them, and keep their cover art in a deduplicating
//! content store. A [`worker`] runs the whole pipeline on its own thread
//! behind a JSON message protocol.

pub mod config;
pub mod download;
pub mod error;
pub mod source;
pub mod store;
pub mod tags;
pub mod worker;
