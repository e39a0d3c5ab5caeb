//! Error Kinds
//!
//! The runtime distinguishes failures that are part of normal reactive
//! control flow from programming errors:
//!
//! - [`NotReadyError`] is a control-flow signal: a read touched a cell whose
//!   upstream data has not arrived yet. Computations catch it and enter the
//!   waiting state instead of failing.
//! - [`Interrupt`] carries either that signal or a real error payload along
//!   the dependency graph. Compute closures propagate it with `?`.
//! - [`ContextNotFoundError`] and [`NoOwnerError`] are thrown by scope
//!   operations used outside the tree they need.

use std::error::Error;
use std::rc::Rc;

/// A read would block on data that is still being produced.
///
/// Raised by [`try_get`](crate::reactive::Signal::try_get) when the cell has
/// its waiting bit set. Computations treat it as "try again later", not as a
/// failure: the cell keeps its previous value and the computation is marked
/// waiting itself.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("reactive value is not ready")]
pub struct NotReadyError;

/// A context lookup found no provider on the owner chain and no default.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("context not found and no default value was provided")]
pub struct ContextNotFoundError;

/// An operation that requires an owner scope ran with none active.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("no reactive owner is active on this thread")]
pub struct NoOwnerError;

/// The failure channel of a tracked computation.
///
/// Reads inside a compute closure return `Result<T, Interrupt>`; the `?`
/// operator re-raises a source's stored condition in the reader's context,
/// which is how both errors and the waiting state travel along observer
/// edges.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Interrupt {
    /// An upstream cell is waiting on data.
    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    /// An upstream cell failed; the payload is shared by every reader.
    #[error("reactive computation failed: {0}")]
    Failure(Rc<dyn Error + 'static>),
}

impl Interrupt {
    /// Wrap an arbitrary error as a failure interrupt.
    pub fn failure(err: impl Error + 'static) -> Self {
        Interrupt::Failure(Rc::new(err))
    }

    /// True when this interrupt is the waiting signal rather than a failure.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Interrupt::NotReady(_))
    }

    /// The error payload, if this is a failure.
    pub fn payload(&self) -> Option<&Rc<dyn Error + 'static>> {
        match self {
            Interrupt::NotReady(_) => None,
            Interrupt::Failure(payload) => Some(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn not_ready_converts_into_interrupt() {
        let interrupt: Interrupt = NotReadyError.into();
        assert!(interrupt.is_not_ready());
        assert!(interrupt.payload().is_none());
    }

    #[test]
    fn failure_keeps_payload() {
        let interrupt = Interrupt::failure(Boom);
        assert!(!interrupt.is_not_ready());
        let payload = interrupt.payload().expect("failure should carry payload");
        assert_eq!(payload.to_string(), "boom");
    }

    #[test]
    fn interrupt_clones_share_payload() {
        let interrupt = Interrupt::failure(Boom);
        let clone = interrupt.clone();
        let a = interrupt.payload().unwrap();
        let b = clone.payload().unwrap();
        assert!(Rc::ptr_eq(a, b));
    }
}
