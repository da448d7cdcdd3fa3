//! Active-object lifecycle
//!
//! ```text
//!             activate()              deactivate()
//!  NotActive ───────────► Active ────────────────► Deactivating
//!      ▲                                                 │
//!      └──────────────────── wait() drains ──────────────┘
//! ```
//!
//! `deactivate()` only signals; `wait()` blocks until the signaled work
//! has drained. A [`CompositeActiveObject`] fans all three out to its
//! children in registration order.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{RpcError, RpcResult};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotActive = 0,
    Active = 1,
    Deactivating = 2,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            1 => LifecycleState::Active,
            2 => LifecycleState::Deactivating,
            _ => LifecycleState::NotActive,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::NotActive => write!(f, "not-active"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Deactivating => write!(f, "deactivating"),
        }
    }
}

/// Atomic lifecycle state cell shared by every active object.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotActive as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// NotActive → Active, or `AlreadyActive`.
    pub fn begin_activate(&self) -> RpcResult<()> {
        self.transition(LifecycleState::NotActive, LifecycleState::Active)
            .then_some(())
            .ok_or(RpcError::AlreadyActive)
    }

    /// Active → Deactivating. False if the object was not active.
    pub fn begin_deactivate(&self) -> bool {
        self.transition(LifecycleState::Active, LifecycleState::Deactivating)
    }

    /// Check that `wait()` may proceed.
    ///
    /// `Ok(true)` means a drain is due, `Ok(false)` means there is nothing
    /// to wait for.
    pub fn check_wait(&self) -> RpcResult<bool> {
        match self.state() {
            LifecycleState::Active => Err(RpcError::StillActive),
            LifecycleState::Deactivating => Ok(true),
            LifecycleState::NotActive => Ok(false),
        }
    }

    /// Deactivating → NotActive, after the drain.
    pub fn finish_wait(&self) {
        self.transition(LifecycleState::Deactivating, LifecycleState::NotActive);
    }

    /// Roll back a failed activation.
    pub fn reset(&self) {
        self.state
            .store(LifecycleState::NotActive as u8, Ordering::Release);
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// The activate/deactivate/wait contract.
pub trait ActiveObject: Send + Sync {
    /// Start owned work. `AlreadyActive` unless currently NotActive.
    fn activate(&self) -> RpcResult<()>;

    /// Signal owned work to stop without blocking. No-op unless Active.
    fn deactivate(&self);

    /// Block until signaled work has drained, then become NotActive.
    ///
    /// `StillActive` if called before `deactivate()`.
    fn wait(&self) -> RpcResult<()>;

    fn state(&self) -> LifecycleState;

    fn active(&self) -> bool {
        self.state() == LifecycleState::Active
    }
}

/// Aggregate of child active objects.
pub struct CompositeActiveObject {
    name: &'static str,
    lifecycle: Lifecycle,
    children: Mutex<Vec<Arc<dyn ActiveObject>>>,
}

impl CompositeActiveObject {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lifecycle: Lifecycle::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Register a child.
    ///
    /// An active composite activates the child; a deactivating one stops
    /// it right away so late additions cannot outlive the drain.
    pub fn add(&self, child: Arc<dyn ActiveObject>) -> RpcResult<()> {
        let mut children = self.children.lock().unwrap();
        match self.lifecycle.state() {
            LifecycleState::Active => match child.activate() {
                Ok(()) | Err(RpcError::AlreadyActive) => {}
                Err(e) => return Err(e),
            },
            LifecycleState::Deactivating => child.deactivate(),
            LifecycleState::NotActive => {}
        }
        children.push(child);
        Ok(())
    }

    /// Unregister a child (compared by identity).
    pub fn remove(&self, child: &Arc<dyn ActiveObject>) -> bool {
        let mut children = self.children.lock().unwrap();
        let before = children.len();
        children.retain(|c| !Arc::ptr_eq(c, child));
        children.len() != before
    }

    pub fn len(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl ActiveObject for CompositeActiveObject {
    fn activate(&self) -> RpcResult<()> {
        let children = self.children.lock().unwrap();
        self.lifecycle.begin_activate()?;

        for (i, child) in children.iter().enumerate() {
            if let Err(e) = child.activate() {
                crate::kerror!("{}: child {} failed to activate: {}", self.name, i, e);
                for started in children[..i].iter().rev() {
                    started.deactivate();
                    let _ = started.wait();
                }
                self.lifecycle.reset();
                return Err(e);
            }
        }
        crate::kdebug!("{}: activated {} children", self.name, children.len());
        Ok(())
    }

    fn deactivate(&self) {
        let children = self.children.lock().unwrap();
        if !self.lifecycle.begin_deactivate() {
            return;
        }
        for child in children.iter() {
            child.deactivate();
        }
    }

    fn wait(&self) -> RpcResult<()> {
        if !self.lifecycle.check_wait()? {
            return Ok(());
        }
        // Snapshot so children may call back into add/remove while draining
        let children: Vec<_> = self.children.lock().unwrap().clone();
        let mut first_err = None;
        for child in children.iter() {
            if let Err(e) = child.wait() {
                first_err.get_or_insert(e);
            }
        }
        self.lifecycle.finish_wait();
        first_err.map_or(Ok(()), Err)
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the order in which children see lifecycle calls.
    struct Probe {
        id: usize,
        log: Arc<Mutex<Vec<(usize, &'static str)>>>,
        lifecycle: Lifecycle,
        fail_activate: bool,
    }

    impl Probe {
        fn new(id: usize, log: &Arc<Mutex<Vec<(usize, &'static str)>>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                log: Arc::clone(log),
                lifecycle: Lifecycle::new(),
                fail_activate: false,
            })
        }
    }

    impl ActiveObject for Probe {
        fn activate(&self) -> RpcResult<()> {
            if self.fail_activate {
                return Err(RpcError::Transport("bind refused".into()));
            }
            self.lifecycle.begin_activate()?;
            self.log.lock().unwrap().push((self.id, "activate"));
            Ok(())
        }

        fn deactivate(&self) {
            if self.lifecycle.begin_deactivate() {
                self.log.lock().unwrap().push((self.id, "deactivate"));
            }
        }

        fn wait(&self) -> RpcResult<()> {
            if self.lifecycle.check_wait()? {
                self.log.lock().unwrap().push((self.id, "wait"));
                self.lifecycle.finish_wait();
            }
            Ok(())
        }

        fn state(&self) -> LifecycleState {
            self.lifecycle.state()
        }
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(LifecycleState::from(0), LifecycleState::NotActive);
        assert_eq!(LifecycleState::from(1), LifecycleState::Active);
        assert_eq!(LifecycleState::from(2), LifecycleState::Deactivating);
        assert_eq!(LifecycleState::from(9), LifecycleState::NotActive);
    }

    #[test]
    fn test_activate_twice_fails() {
        let lc = Lifecycle::new();
        assert!(lc.begin_activate().is_ok());
        assert_eq!(lc.begin_activate(), Err(RpcError::AlreadyActive));

        assert!(lc.begin_deactivate());
        // Still draining: a restart must wait for wait()
        assert_eq!(lc.begin_activate(), Err(RpcError::AlreadyActive));
        lc.finish_wait();
        assert!(lc.begin_activate().is_ok());
    }

    #[test]
    fn test_deactivate_idempotent_and_wait_rules() {
        let lc = Lifecycle::new();
        assert!(!lc.begin_deactivate());
        assert_eq!(lc.check_wait(), Ok(false));

        lc.begin_activate().unwrap();
        assert_eq!(lc.check_wait(), Err(RpcError::StillActive));
        assert!(lc.begin_deactivate());
        assert!(!lc.begin_deactivate());
        assert_eq!(lc.check_wait(), Ok(true));
        lc.finish_wait();
        assert_eq!(lc.state(), LifecycleState::NotActive);
    }

    #[test]
    fn test_composite_fans_out_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeActiveObject::new("test");
        for id in 0..3 {
            composite.add(Probe::new(id, &log)).unwrap();
        }

        composite.activate().unwrap();
        assert_eq!(composite.activate(), Err(RpcError::AlreadyActive));
        composite.deactivate();
        composite.wait().unwrap();
        assert_eq!(composite.state(), LifecycleState::NotActive);

        let expected: Vec<(usize, &str)> = ["activate", "deactivate", "wait"]
            .iter()
            .flat_map(|op| (0..3).map(move |id| (id, *op)))
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_composite_late_child() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeActiveObject::new("test");
        composite.activate().unwrap();

        let early = Probe::new(0, &log);
        composite.add(early.clone()).unwrap();
        assert!(early.active());

        composite.deactivate();
        let late = Probe::new(1, &log);
        late.activate().unwrap();
        composite.add(late.clone()).unwrap();
        assert_eq!(late.state(), LifecycleState::Deactivating);

        composite.wait().unwrap();
        assert_eq!(early.state(), LifecycleState::NotActive);
        assert_eq!(late.state(), LifecycleState::NotActive);
        assert_eq!(composite.len(), 2);

        let as_dyn: Arc<dyn ActiveObject> = late;
        assert!(composite.remove(&as_dyn));
        assert!(!composite.remove(&as_dyn));
    }

    #[test]
    fn test_composite_rolls_back_failed_activation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeActiveObject::new("test");
        let ok = Probe::new(0, &log);
        composite.add(ok.clone()).unwrap();
        composite
            .add(Arc::new(Probe {
                id: 1,
                log: Arc::clone(&log),
                lifecycle: Lifecycle::new(),
                fail_activate: true,
            }))
            .unwrap();

        assert!(matches!(composite.activate(), Err(RpcError::Transport(_))));
        assert_eq!(composite.state(), LifecycleState::NotActive);
        assert_eq!(ok.state(), LifecycleState::NotActive);

        let waits = log.lock().unwrap().iter().filter(|(_, op)| *op == "wait").count();
        assert_eq!(waits, 1);
    }
}
