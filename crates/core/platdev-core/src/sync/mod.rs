//! Synchronization primitives.

mod completion;

pub use completion::{CompletionSignal, WaitOutcome};
