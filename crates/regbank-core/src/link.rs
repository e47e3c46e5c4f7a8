//! Non-owning links between collaborating peripherals.
//!
//! The enclosing platform owns every peripheral. A collaborator link only
//! borrows its target for the duration of one call and refuses to enter a
//! target that is already in use further up the call stack.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use thiserror::Error;

/// Failure to reach a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No target was wired, or the target has been dropped.
    #[error("collaborator detached")]
    Detached,
    /// The target is already executing a call higher up the stack.
    #[error("collaborator busy (reentrant call)")]
    Busy,
}

/// Weak reference to a peripheral owned elsewhere.
pub struct Collaborator<T: ?Sized> {
    target: Option<Weak<RefCell<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for Collaborator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborator")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<T: ?Sized> Clone for Collaborator<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
        }
    }
}

impl<T: ?Sized> Default for Collaborator<T> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<T: ?Sized> Collaborator<T> {
    /// A link to `target` that does not keep it alive.
    #[must_use]
    pub fn new(target: &Rc<RefCell<T>>) -> Self {
        Self {
            target: Some(Rc::downgrade(target)),
        }
    }

    /// A link with no target.
    #[must_use]
    pub const fn detached() -> Self {
        Self { target: None }
    }

    /// Whether the target is wired and still alive.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|target| target.strong_count() > 0)
    }

    /// Runs `f` with exclusive access to the target.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Detached`] when there is no live target and
    /// [`LinkError::Busy`] when the target is already borrowed.
    pub fn call<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, LinkError> {
        let target = self
            .target
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(LinkError::Detached)?;
        let mut guard = target.try_borrow_mut().map_err(|_| LinkError::Busy)?;
        Ok(f(&mut *guard))
    }
}

#[cfg(test)]
mod tests {
    use super::{Collaborator, LinkError};
    use std::cell::RefCell;
    use std::rc::Rc;

    trait Counter {
        fn bump(&mut self) -> u32;
    }

    struct Simple(u32);

    impl Counter for Simple {
        fn bump(&mut self) -> u32 {
            self.0 += 1;
            self.0
        }
    }

    #[test]
    fn calls_through_trait_object() {
        let target: Rc<RefCell<dyn Counter>> = Rc::new(RefCell::new(Simple(0)));
        let link = Collaborator::new(&target);
        assert_eq!(link.call(|c| c.bump()), Ok(1));
        assert_eq!(link.call(|c| c.bump()), Ok(2));
    }

    #[test]
    fn reentry_fails_fast() {
        let target = Rc::new(RefCell::new(Simple(0)));
        let link = Collaborator::new(&target);
        let inner = link.clone();
        let nested = link.call(|_| inner.call(Simple::bump));
        assert_eq!(nested, Ok(Err(LinkError::Busy)));
    }

    #[test]
    fn dropped_target_is_detached() {
        let target = Rc::new(RefCell::new(Simple(0)));
        let link = Collaborator::new(&target);
        drop(target);
        assert!(!link.is_attached());
        assert_eq!(link.call(Simple::bump), Err(LinkError::Detached));
        assert_eq!(
            Collaborator::<Simple>::detached().call(Simple::bump),
            Err(LinkError::Detached)
        );
    }
}
