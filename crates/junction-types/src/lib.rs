pub mod plan;
pub mod result;

pub use plan::*;
pub use result::*;
