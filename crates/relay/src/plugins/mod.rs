//! Built-in plugins.

mod dspy;
mod fuzz;
mod kvtools;
mod logger;
mod sampler;
mod slwin;
mod stools;

pub use dspy::Dspy;
pub use fuzz::Fuzz;
pub use kvtools::KvTools;
pub use logger::Logger;
pub use sampler::Sampler;
pub use slwin::SlidingWindow;
pub use stools::StripTools;
