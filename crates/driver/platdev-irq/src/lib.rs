//! `platdev-irq` --- interrupt dispatch.
//!
//! An [`IrqDispatcher`] owns a table of interrupt lines. Drivers register an
//! immediate handler, which runs when the line is raised and must not block,
//! and optionally a deferred handler, which runs later in a context that may
//! block. The [`IrqPolicy`] of a registration decides whether the line may be
//! shared, where the deferred handler runs, and whether bursts of interrupts
//! are coalesced into a single deferred run.
//!
//! Handler panics never escape the dispatcher; they are caught and reported
//! through the [`EventSink`](platdev_core::EventSink).

mod dispatcher;
mod executor;
pub mod policy;

use core::fmt;

pub use dispatcher::{DeferredHandler, ImmediateHandler, IrqDispatcher, IrqRegistration, RaiseOutcome};
pub use policy::{IrqPolicy, IrqReturn, Sharing, Threading};

/// Errors from interrupt registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrqError {
    /// An exclusive holder owns the line.
    LineAlreadyExclusive {
        /// The requested line.
        line: u32,
    },
    /// An exclusive registration was requested on an occupied line.
    LineBusy {
        /// The requested line.
        line: u32,
    },
    /// Shared holders of a line must agree on one-shot threading.
    PolicyMismatch {
        /// The requested line.
        line: u32,
    },
    /// The policy cannot be honored with the given handlers.
    InvalidPolicy(&'static str),
    /// A handler thread could not be started.
    ThreadSpawn(String),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LineAlreadyExclusive { line } => {
                write!(f, "interrupt line {line} is held exclusively")
            }
            Self::LineBusy { line } => {
                write!(f, "interrupt line {line} is in use; cannot register exclusively")
            }
            Self::PolicyMismatch { line } => {
                write!(f, "interrupt line {line} holders disagree on one-shot threading")
            }
            Self::InvalidPolicy(why) => write!(f, "invalid interrupt policy: {why}"),
            Self::ThreadSpawn(err) => write!(f, "failed to start handler thread: {err}"),
        }
    }
}

impl std::error::Error for IrqError {}
