pub mod document;
pub mod host;
