//! The opam package description format.

pub mod parser;
pub mod render;
pub mod version;

pub use parser::{parse, OpamFile, SyntaxError, Value};
pub use render::{parse_url_file, render, RenderedOpam, UrlSpec};
pub use version::OpamVersion;
