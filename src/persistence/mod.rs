pub mod query;
pub mod retention;
pub mod writer;

pub use writer::{TickWriter, TickWriterHandle};
