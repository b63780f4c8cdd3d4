//! One-shot continuations and the `Gather` fan-in.
//!
//! The MDS is a single-threaded cooperative actor: "asynchrony" is a
//! completion handle registered with some subsystem and invoked later by
//! the same event loop. Nothing here is `Send`; mutual exclusion comes from
//! loop dispatch.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A one-shot continuation.
///
/// Subsystems take a `Completion` when work will finish asynchronously,
/// and call [`finish`](Self::finish) exactly once from the event loop when
/// it does.
pub struct Completion {
    f: Box<dyn FnOnce()>,
}

impl Completion {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// A completion that does nothing when fired.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Consume the handle and run the continuation.
    pub fn finish(self) {
        (self.f)();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

struct GatherInner {
    pending: Cell<usize>,
    activated: Cell<bool>,
    target: RefCell<Option<Completion>>,
}

impl GatherInner {
    fn maybe_fire(&self) {
        if self.activated.get() && self.pending.get() == 0 {
            if let Some(target) = self.target.borrow_mut().take() {
                target.finish();
            }
        }
    }
}

/// Fan-in completion: wraps a target completion and fires it exactly once
/// after every sub-completion handed out by [`new_sub`](Self::new_sub) has
/// fired.
///
/// Subs may fire before the creator has finished handing them out; the
/// target is held back until the gather is activated (explicitly or by
/// drop). A gather that never hands out a sub fires the target at
/// activation, so registering zero dependencies still completes.
pub struct Gather {
    inner: Rc<GatherInner>,
}

impl Gather {
    #[must_use]
    pub fn new(target: Completion) -> Self {
        Self {
            inner: Rc::new(GatherInner {
                pending: Cell::new(0),
                activated: Cell::new(false),
                target: RefCell::new(Some(target)),
            }),
        }
    }

    /// Hand out a fresh sub-completion, incrementing the pending count.
    #[must_use]
    pub fn new_sub(&self) -> Completion {
        self.inner.pending.set(self.inner.pending.get() + 1);
        let inner = Rc::clone(&self.inner);
        Completion::new(move || {
            inner.pending.set(inner.pending.get() - 1);
            inner.maybe_fire();
        })
    }

    /// Number of subs still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.get()
    }

    /// Done handing out subs; the target may now fire as soon as the
    /// pending count reaches zero (immediately, if it already has).
    pub fn activate(self) {
        // Drop runs the activation.
    }
}

impl Drop for Gather {
    fn drop(&mut self) {
        self.inner.activated.set(true);
        self.inner.maybe_fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag() -> (Rc<Cell<bool>>, Completion) {
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        (fired, Completion::new(move || f.set(true)))
    }

    #[test]
    fn empty_gather_fires_at_activation() {
        let (fired, target) = flag();
        let gather = Gather::new(target);
        assert!(!fired.get());
        gather.activate();
        assert!(fired.get());
    }

    #[test]
    fn gather_fires_exactly_once_after_last_sub() {
        let count = Rc::new(Cell::new(0_u32));
        let c = Rc::clone(&count);
        let gather = Gather::new(Completion::new(move || c.set(c.get() + 1)));

        let subs: Vec<Completion> = (0..3).map(|_| gather.new_sub()).collect();
        gather.activate();
        assert_eq!(count.get(), 0);

        let mut subs = subs.into_iter();
        subs.next().unwrap().finish();
        subs.next().unwrap().finish();
        assert_eq!(count.get(), 0);
        subs.next().unwrap().finish();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn subs_fired_before_activation_do_not_fire_target_early() {
        let (fired, target) = flag();
        let gather = Gather::new(target);
        let sub = gather.new_sub();
        sub.finish();
        assert!(!fired.get());
        gather.activate();
        assert!(fired.get());
    }

    #[test]
    fn dropping_an_unactivated_gather_activates_it() {
        let (fired, target) = flag();
        {
            let _gather = Gather::new(target);
        }
        assert!(fired.get());
    }
}
