pub mod engine;
pub mod importer;

pub use engine::*;
pub use importer::*;
