pub mod job;
pub mod queue;

pub use job::*;
pub use queue::*;
