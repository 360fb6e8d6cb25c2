//! Ambient execution context — the per-thread stack of active isolation
//! boundaries.
//!
//! Module code frequently resolves resources through whatever boundary it
//! was loaded in without threading it through every call. The manager
//! pushes the module's boundary before invoking lifecycle hooks or
//! operations and pops it afterwards, unwind included, via the RAII guard.

use std::cell::RefCell;
use std::sync::Arc;

use crate::boundary::IsolationBoundary;

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<IsolationBoundary>>> = const { RefCell::new(Vec::new()) };
}

/// The boundary most recently entered on this thread, if any.
pub fn current_boundary() -> Option<Arc<IsolationBoundary>> {
    ACTIVE.with(|stack| stack.borrow().last().cloned())
}

/// Pushes `boundary` as the ambient one; dropping the guard restores the
/// previous ambient boundary, on normal return or unwind alike.
pub fn enter(boundary: Arc<IsolationBoundary>) -> BoundaryGuard {
    ACTIVE.with(|stack| stack.borrow_mut().push(boundary));
    BoundaryGuard { _priv: () }
}

/// Runs `f` with `boundary` ambient.
pub fn with_boundary<R>(boundary: &Arc<IsolationBoundary>, f: impl FnOnce() -> R) -> R {
    let _guard = enter(Arc::clone(boundary));
    f()
}

pub struct BoundaryGuard {
    _priv: (),
}

impl Drop for BoundaryGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn boundary() -> Arc<IsolationBoundary> {
        Arc::new(IsolationBoundary::new(Vec::new()))
    }

    #[test]
    fn guard_restores_previous_boundary() {
        let outer = boundary();
        let inner = boundary();
        assert!(current_boundary().is_none());
        {
            let _g1 = enter(Arc::clone(&outer));
            {
                let _g2 = enter(Arc::clone(&inner));
                let current = current_boundary().unwrap();
                assert!(Arc::ptr_eq(&current, &inner));
            }
            let current = current_boundary().unwrap();
            assert!(Arc::ptr_eq(&current, &outer));
        }
        assert!(current_boundary().is_none());
    }

    #[test]
    fn guard_pops_on_unwind() {
        let b = boundary();
        let result = catch_unwind(AssertUnwindSafe(|| {
            with_boundary(&b, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(current_boundary().is_none());
    }
}
