pub mod extraction;
pub mod strategies;

pub use extraction::*;
pub use strategies::*;
