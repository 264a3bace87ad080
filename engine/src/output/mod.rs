//! Report output formats

pub mod json;
pub mod text;

pub use json::generate_json;
pub use text::write_text;
