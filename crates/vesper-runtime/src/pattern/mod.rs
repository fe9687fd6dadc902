//! Pattern matching over event streams.
//!
//! - [`CompiledPattern`]: the immutable node table built once per statement
//! - [`PatternEngine`]: live partial matches, advanced by events and by time
//! - [`CompletedMatch`]: one full binding of the pattern's tags

mod arena;
mod compile;
mod engine;

pub use arena::StateId;
pub use compile::{CompiledPattern, TagInfo};
pub use engine::{CompletedMatch, PatternEngine};
