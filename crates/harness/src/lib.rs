pub mod chain;
pub mod fixtures;

pub use chain::{Directory, ScriptedChain};
