pub mod assembler;
pub mod dedupe;
pub mod normalize;

pub use assembler::*;
pub use dedupe::*;
pub use normalize::*;
