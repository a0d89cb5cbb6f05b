pub mod engine;
pub mod registry;
pub mod resolver;
pub mod upsert;

pub use engine::*;
pub use registry::*;
pub use resolver::*;
pub use upsert::*;
