//! `platdev-core` --- shared primitives for the platform-device core.
//!
//! This crate contains the pieces every other `platdev` crate depends on:
//!
//! - [`sync::CompletionSignal`]: one-shot waitable flag with timeout and
//!   cancellation, used to hand DMA completion from a deferred interrupt
//!   handler to a blocked caller.
//! - [`event`]: monitoring events and the [`EventSink`](event::EventSink)
//!   seam through which diagnostics leave the core.
//! - [`config`]: TOML-backed tunables for the interrupt, DMA, and lifecycle
//!   subsystems.
//! - [`id`]: small identifier newtypes shared across crates.

pub mod config;
pub mod event;
pub mod id;
pub mod sync;

pub use config::{Config, ConfigError};
pub use event::{Event, EventKind, EventSink};
pub use id::DeviceId;
pub use sync::{CompletionSignal, WaitOutcome};
