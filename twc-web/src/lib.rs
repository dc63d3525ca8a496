//! Torrent web cache HTTP front end
//!
//! Serves file contents, raw pieces and completed-piece records of torrents
//! out of the core caching pipeline.

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]

pub mod error;
pub mod handlers;
pub mod server;

pub use error::WebError;
pub use server::{AppState, build_router, run_server};
