//! Domain models for the build orchestration core.

pub mod build;
pub mod builder;
pub mod buildset;
pub mod repository;
pub mod revision;
pub mod step;

pub use build::*;
pub use builder::*;
pub use buildset::*;
pub use repository::*;
pub use revision::*;
pub use step::*;
