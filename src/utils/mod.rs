pub mod file;

pub use file::{cover_extension, sanitize_component, unique_destination};
