//! Shared ownership with once-only destruction
//!
//! `Ref<T>` is an owning, atomically counted handle; `WeakRef<T>` is the
//! non-owning back-reference handed to events and observers so they can
//! never keep a call alive past its own lifetime.
//!
//! ```text
//!   Ref::new ──► count = 1
//!   acquire  ──► count + 1          (any thread holding a Ref)
//!   release  ──► count - 1 ──► 0 ──► T dropped on the releasing thread
//!   WeakRef::lock ──► Some(Ref) while count > 0, None afterwards
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Owning reference. Duplicating it never copies `T`.
pub struct Ref<T: ?Sized>(Arc<T>);

impl<T> Ref<T> {
    pub fn new(value: T) -> Self {
        Ref(Arc::new(value))
    }

    /// Build a value that stores a back-reference to itself.
    ///
    /// The `WeakRef` passed to `f` cannot be locked until `new_cyclic`
    /// returns.
    pub fn new_cyclic<F>(f: F) -> Self
    where
        F: FnOnce(&WeakRef<T>) -> T,
    {
        Ref(Arc::new_cyclic(|weak| f(&WeakRef(weak.clone()))))
    }

    /// Give up this reference. Returns true if this call destroyed the
    /// value, which then happened on the calling thread.
    #[inline]
    pub fn release(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }
}

impl<T: ?Sized> Ref<T> {
    /// Take another owning reference.
    #[inline]
    pub fn acquire(&self) -> Ref<T> {
        Ref(Arc::clone(&self.0))
    }

    #[inline]
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef(Arc::downgrade(&self.0))
    }

    /// Current owning count (a snapshot).
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Ref<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn as_arc(&self) -> &Arc<T> {
        &self.0
    }

    #[inline]
    pub fn into_arc(self) -> Arc<T> {
        self.0
    }
}

impl<T: ?Sized> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl<T: ?Sized> Deref for Ref<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> From<Arc<T>> for Ref<T> {
    fn from(arc: Arc<T>) -> Self {
        Ref(arc)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&&*self.0).finish()
    }
}

/// Non-owning back-reference.
pub struct WeakRef<T: ?Sized>(Weak<T>);

impl<T> WeakRef<T> {
    /// A reference that never resolves.
    pub fn new() -> Self {
        WeakRef(Weak::new())
    }
}

impl<T> Default for WeakRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> WeakRef<T> {
    /// Resolve to a live owning reference, or `None` if already destroyed.
    #[inline]
    pub fn lock(&self) -> Option<Ref<T>> {
        self.0.upgrade().map(Ref)
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    #[inline]
    pub fn as_weak(&self) -> &Weak<T> {
        &self.0
    }
}

impl<T: ?Sized> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        WeakRef(self.0.clone())
    }
}

impl<T: ?Sized> From<Weak<T>> for WeakRef<T> {
    fn from(weak: Weak<T>) -> Self {
        WeakRef(weak)
    }
}

impl<T: ?Sized> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakRef(alive={})", self.is_alive())
    }
}
