//! Schema module - Parameter domain, designs, and run configuration types.

mod config;
mod design;
mod parameter;
mod project;

pub use config::*;
pub use design::*;
pub use parameter::*;
pub use project::*;
