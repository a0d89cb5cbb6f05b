pub mod ocr;
pub mod redis;

pub use ocr::*;
pub use redis::*;
