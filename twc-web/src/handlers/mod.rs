//! HTTP request handlers organized by functionality

pub mod body;
pub mod completed;
pub mod content;
pub mod piece;
pub mod range;
pub mod source;

// Re-export handler functions
pub use completed::serve_completed_pieces;
pub use content::serve_content;
pub use piece::serve_piece;
pub use range::{RangeSelection, parse_range_header};
pub use source::{download_rate, resolve_source_url};
