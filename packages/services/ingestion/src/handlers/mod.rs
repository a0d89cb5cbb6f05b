pub mod breaker;
pub mod fetcher;

pub use breaker::*;
pub use fetcher::*;
