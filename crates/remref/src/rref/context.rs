//! Distributed reference-counting engine.
//!
//! One `RRefContext` per worker tracks the references this process owns
//! (with their live-fork sets and value futures) and the user-role forks
//! it holds on remote values. All mutation goes through the create, fork,
//! and delete operations below; each is individually atomic under a
//! single registry lock with a bounded critical section.
//!
//! Delete-notifies that arrive before their matching fork-notify are
//! buffered until the fork shows up, so correctness does not depend on
//! the transport preserving per-pair ordering.

use crate::future::FutureCell;
use crate::types::{ForkId, RRefForkData, RRefId, RpcError, RpcResult, Value, WorkerId, WorkerInfo};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Control message queued for asynchronous delivery to an owner.
#[derive(Debug)]
pub(crate) enum ControlNotify {
    /// A fork of an owned reference is now held by `held_by`.
    Fork {
        owner: WorkerInfo,
        fork: RRefForkData,
        held_by: WorkerId,
    },
    /// A fork has been dropped by the worker that held it.
    Delete { owner: WorkerInfo, fork_id: ForkId },
}

struct OwnerEntry {
    /// The value, or the pending future for it (pending-owner state).
    value: Arc<FutureCell<Value>>,
    /// Forks acknowledged as live; the entry is released only when this
    /// set is empty and no local handle remains.
    forks: HashSet<ForkId>,
    /// Owner-role handles held inside this process.
    local_handles: usize,
}

struct Inner {
    owners: HashMap<RRefId, OwnerEntry>,
    /// User-role forks held by this process, mapped to their owner.
    users: HashMap<ForkId, WorkerInfo>,
    /// Delete-notifies waiting for their matching fork-notify.
    pending_deletes: HashSet<ForkId>,
    destroyed: bool,
}

/// Per-worker registry implementing the fork/delete protocol.
pub struct RRefContext {
    self_id: WorkerId,
    next_seq: AtomicU64,
    inner: Mutex<Inner>,
    control_tx: mpsc::UnboundedSender<ControlNotify>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlNotify>>>,
}

impl RRefContext {
    /// Create the context for the given worker.
    pub fn new(self_id: WorkerId) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            self_id,
            next_seq: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                owners: HashMap::new(),
                users: HashMap::new(),
                pending_deletes: HashSet::new(),
                destroyed: false,
            }),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// The worker this context belongs to.
    pub fn worker_id(&self) -> WorkerId {
        self.self_id
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Mint a fresh reference id. Never reused.
    pub fn next_rref_id(&self) -> RRefId {
        RRefId::new(self.self_id, self.seq())
    }

    /// Mint a fresh fork id for a reference.
    pub fn next_fork_id(&self, rref_id: RRefId) -> ForkId {
        ForkId::new(rref_id, self.self_id, self.seq())
    }

    /// Take the control-message receiver for the forwarder task.
    pub(crate) fn take_control_rx(&self) -> Option<mpsc::UnboundedReceiver<ControlNotify>> {
        self.control_rx.lock().expect("rref lock poisoned").take()
    }

    fn ensure_alive(inner: &Inner) -> RpcResult<()> {
        if inner.destroyed {
            Err(RpcError::ContextDestroyed)
        } else {
            Ok(())
        }
    }

    /// Create an owner-role entry in pending state, optionally seeding it
    /// with the fork the creating request carried.
    ///
    /// Returns the value future to complete once the computation finishes.
    /// If a fetch for the same reference arrived first and left a pending
    /// entry behind, that entry (and its waiters) is reused.
    pub fn create_owner(
        &self,
        rref_id: RRefId,
        initial_fork: Option<ForkId>,
    ) -> RpcResult<Arc<FutureCell<Value>>> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;

        // The delete may have raced ahead of the creating request.
        let seeded = initial_fork.filter(|fork| !inner.pending_deletes.remove(fork));
        let cancelled = initial_fork.is_some() && seeded.is_none();

        let entry = inner.owners.entry(rref_id).or_insert_with(|| OwnerEntry {
            value: Arc::new(FutureCell::new()),
            forks: HashSet::new(),
            local_handles: 0,
        });
        let value = Arc::clone(&entry.value);
        if let Some(fork) = seeded {
            entry.forks.insert(fork);
        }
        if cancelled {
            // The only fork the creator minted is already gone.
            Self::maybe_release(&mut inner, rref_id);
        }
        debug!("created owner entry for {}", rref_id);
        Ok(value)
    }

    /// Get the value future of an owned reference.
    ///
    /// # Errors
    ///
    /// `RRefNotFound` if this worker does not (or no longer does) own the
    /// reference.
    pub fn owner_value(&self, rref_id: RRefId) -> RpcResult<Arc<FutureCell<Value>>> {
        let inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;
        inner
            .owners
            .get(&rref_id)
            .map(|e| Arc::clone(&e.value))
            .ok_or(RpcError::RRefNotFound(rref_id))
    }

    /// Get the value future of an owned reference, creating a pending
    /// entry if the creating request has not arrived yet.
    ///
    /// This is the fetch path for transports that do not order requests
    /// between a pair of workers: a fetch that overtakes the remote-create
    /// request waits on the entry the create will complete. The caller is
    /// expected to hold a live fork of the reference.
    pub fn owner_value_pending_create(&self, rref_id: RRefId) -> RpcResult<Arc<FutureCell<Value>>> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;
        let entry = inner.owners.entry(rref_id).or_insert_with(|| {
            debug!("fetch for {} arrived before its create", rref_id);
            OwnerEntry {
                value: Arc::new(FutureCell::new()),
                forks: HashSet::new(),
                local_handles: 0,
            }
        });
        Ok(Arc::clone(&entry.value))
    }

    /// Owner side of a fork-notify: add the fork to the live set.
    ///
    /// Cancels out against a buffered out-of-order delete for the same
    /// fork instead of adding it.
    pub fn add_fork(&self, fork: ForkId) -> RpcResult<()> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;

        if inner.pending_deletes.remove(&fork) {
            debug!("fork-notify for {} matched a buffered delete", fork);
            Self::maybe_release(&mut inner, fork.rref_id);
            return Ok(());
        }

        let entry = inner
            .owners
            .get_mut(&fork.rref_id)
            .ok_or(RpcError::RRefNotFound(fork.rref_id))?;
        entry.forks.insert(fork);
        debug!("added fork {} ({} live)", fork, entry.forks.len());
        Ok(())
    }

    /// Owner side of a delete-notify: remove the fork from the live set
    /// and release the value if nothing holds the reference anymore.
    ///
    /// A delete whose fork-notify has not arrived yet is buffered.
    pub fn remove_fork(&self, fork: ForkId) -> RpcResult<()> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;

        match inner.owners.get_mut(&fork.rref_id) {
            Some(entry) => {
                if entry.forks.remove(&fork) {
                    debug!("removed fork {} ({} live)", fork, entry.forks.len());
                    Self::maybe_release(&mut inner, fork.rref_id);
                } else {
                    debug!("buffering out-of-order delete for {}", fork);
                    inner.pending_deletes.insert(fork);
                }
                Ok(())
            }
            None => {
                warn!("delete for {} but the owner entry is gone", fork);
                Ok(())
            }
        }
    }

    fn maybe_release(inner: &mut Inner, rref_id: RRefId) {
        let release = inner
            .owners
            .get(&rref_id)
            .map(|e| e.forks.is_empty() && e.local_handles == 0)
            .unwrap_or(false);
        if release {
            inner.owners.remove(&rref_id);
            debug!("released owned value for {}", rref_id);
        }
    }

    /// Account for an owner-role handle created inside this process.
    pub fn retain_local_handle(&self, rref_id: RRefId) -> RpcResult<()> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;
        let entry = inner
            .owners
            .get_mut(&rref_id)
            .ok_or(RpcError::RRefNotFound(rref_id))?;
        entry.local_handles += 1;
        Ok(())
    }

    /// Account for a dropped owner-role handle. Best effort: drop paths
    /// must not fail.
    pub fn release_local_handle(&self, rref_id: RRefId) {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        if inner.destroyed {
            return;
        }
        if let Some(entry) = inner.owners.get_mut(&rref_id) {
            entry.local_handles = entry.local_handles.saturating_sub(1);
            Self::maybe_release(&mut inner, rref_id);
        }
    }

    /// Register a user-role fork held by this process.
    pub fn register_user(&self, fork: &RRefForkData) -> RpcResult<()> {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        Self::ensure_alive(&inner)?;
        inner.users.insert(fork.fork_id, fork.owner.clone());
        Ok(())
    }

    /// Queue a fork-notify for asynchronous delivery to the owner.
    pub(crate) fn enqueue_fork_notify(&self, fork: RRefForkData, held_by: WorkerId) -> RpcResult<()> {
        {
            let inner = self.inner.lock().expect("rref lock poisoned");
            Self::ensure_alive(&inner)?;
        }
        let owner = fork.owner.clone();
        let _ = self.control_tx.send(ControlNotify::Fork {
            owner,
            fork,
            held_by,
        });
        Ok(())
    }

    /// Discard a user-role fork without notifying the owner.
    ///
    /// Used when the request that was meant to carry the fork never left
    /// this worker, so the owner has nothing to be told about.
    pub(crate) fn unregister_user(&self, fork_id: ForkId) {
        self.inner
            .lock()
            .expect("rref lock poisoned")
            .users
            .remove(&fork_id);
    }

    /// A user-role handle was dropped: queue the delete-notify. Best
    /// effort: drop paths must not fail.
    pub fn user_dropped(&self, fork_id: ForkId) {
        let owner = {
            let mut inner = self.inner.lock().expect("rref lock poisoned");
            if inner.destroyed {
                return;
            }
            inner.users.remove(&fork_id)
        };
        if let Some(owner) = owner {
            let _ = self
                .control_tx
                .send(ControlNotify::Delete { owner, fork_id });
        }
    }

    /// Hard teardown: discard all reference state.
    ///
    /// Pending owner values fail with `ContextDestroyed`; outstanding
    /// handles become invalid for any new operation, while values already
    /// materialized in caller memory stay valid.
    pub fn destroy_instance(&self) {
        let mut inner = self.inner.lock().expect("rref lock poisoned");
        if inner.destroyed {
            return;
        }
        for (_, entry) in inner.owners.iter() {
            entry.value.fail_if_pending(RpcError::ContextDestroyed);
        }
        inner.owners.clear();
        inner.users.clear();
        inner.pending_deletes.clear();
        inner.destroyed = true;
        debug!("rref context destroyed on {}", self.self_id);
    }

    /// Whether the context has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().expect("rref lock poisoned").destroyed
    }

    /// Introspection: number of live forks the owner tracks for a
    /// reference (zero if not owned here).
    pub fn fork_count(&self, rref_id: RRefId) -> usize {
        self.inner
            .lock()
            .expect("rref lock poisoned")
            .owners
            .get(&rref_id)
            .map(|e| e.forks.len())
            .unwrap_or(0)
    }

    /// Introspection: whether this worker currently owns the reference.
    pub fn owns(&self, rref_id: RRefId) -> bool {
        self.inner
            .lock()
            .expect("rref lock poisoned")
            .owners
            .contains_key(&rref_id)
    }

    /// Introspection: number of owned references.
    pub fn owned_count(&self) -> usize {
        self.inner.lock().expect("rref lock poisoned").owners.len()
    }

    /// Introspection: number of user-role forks held by this process.
    pub fn user_count(&self) -> usize {
        self.inner.lock().expect("rref lock poisoned").users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RRefContext {
        RRefContext::new(WorkerId::new(0))
    }

    #[test]
    fn test_ids_are_monotonic_and_distinct() {
        let ctx = ctx();
        let a = ctx.next_rref_id();
        let b = ctx.next_rref_id();
        assert_ne!(a, b);
        assert_eq!(a.created_on, WorkerId::new(0));
    }

    #[test]
    fn test_owner_lifecycle_with_forks() {
        let ctx = ctx();
        let rref_id = ctx.next_rref_id();
        let fork = ctx.next_fork_id(rref_id);

        let value = ctx.create_owner(rref_id, Some(fork)).unwrap();
        value.complete(json!(5));
        assert!(ctx.owns(rref_id));
        assert_eq!(ctx.fork_count(rref_id), 1);

        let second = ctx.next_fork_id(rref_id);
        ctx.add_fork(second).unwrap();
        assert_eq!(ctx.fork_count(rref_id), 2);

        ctx.remove_fork(fork).unwrap();
        assert!(ctx.owns(rref_id));
        ctx.remove_fork(second).unwrap();

        // Last fork gone, no local handles: the value is released.
        assert!(!ctx.owns(rref_id));
        assert_eq!(ctx.owner_value(rref_id).unwrap_err(), RpcError::RRefNotFound(rref_id));
    }

    #[test]
    fn test_local_handle_keeps_value_alive() {
        let ctx = ctx();
        let rref_id = ctx.next_rref_id();
        let fork = ctx.next_fork_id(rref_id);

        let value = ctx.create_owner(rref_id, Some(fork)).unwrap();
        value.complete(json!("v"));
        ctx.retain_local_handle(rref_id).unwrap();

        ctx.remove_fork(fork).unwrap();
        assert!(ctx.owns(rref_id), "local handle must keep the value alive");

        ctx.release_local_handle(rref_id);
        assert!(!ctx.owns(rref_id));
    }

    #[test]
    fn test_delete_before_fork_is_buffered() {
        let ctx = ctx();
        let rref_id = ctx.next_rref_id();
        let initial = ctx.next_fork_id(rref_id);
        ctx.create_owner(rref_id, Some(initial)).unwrap();

        // Delete for a fork whose notify has not arrived yet.
        let late_fork = ctx.next_fork_id(rref_id);
        ctx.remove_fork(late_fork).unwrap();
        assert_eq!(ctx.fork_count(rref_id), 1);

        // The fork-notify arrives afterwards and cancels out.
        ctx.add_fork(late_fork).unwrap();
        assert_eq!(ctx.fork_count(rref_id), 1);
        assert!(ctx.owns(rref_id));
    }

    #[test]
    fn test_create_owner_without_fork_persists() {
        let ctx = ctx();
        let rref_id = ctx.next_rref_id();

        // No initial fork: the entry must survive until a local handle
        // is retained and later released.
        let value = ctx.create_owner(rref_id, None).unwrap();
        assert!(ctx.owns(rref_id));
        ctx.retain_local_handle(rref_id).unwrap();
        value.complete(json!(7));

        assert_eq!(
            ctx.owner_value(rref_id).unwrap().try_result(),
            Some(Ok(json!(7)))
        );
        ctx.release_local_handle(rref_id);
        assert!(!ctx.owns(rref_id));
    }

    #[test]
    fn test_fetch_before_create_shares_the_entry() {
        let ctx = ctx();
        let rref_id = RRefId::new(WorkerId::new(3), 0);
        let fork = ForkId::new(rref_id, WorkerId::new(3), 1);

        // Fetch arrives first and parks on a pending entry.
        let parked = ctx.owner_value_pending_create(rref_id).unwrap();
        assert!(!parked.is_ready());

        // The create reuses that entry and seeds its fork.
        let created = ctx.create_owner(rref_id, Some(fork)).unwrap();
        assert!(Arc::ptr_eq(&parked, &created));
        assert_eq!(ctx.fork_count(rref_id), 1);

        created.complete(json!(11));
        assert_eq!(parked.try_result(), Some(Ok(json!(11))));
    }

    #[test]
    fn test_unregister_user_sends_no_delete() {
        let ctx = ctx();
        let owner = WorkerInfo::new(WorkerId::new(1), "owner");
        let rref_id = RRefId::new(WorkerId::new(0), 0);
        let fork = RRefForkData {
            rref_id,
            fork_id: ForkId::new(rref_id, WorkerId::new(0), 1),
            owner,
        };

        ctx.register_user(&fork).unwrap();
        ctx.unregister_user(fork.fork_id);
        assert_eq!(ctx.user_count(), 0);

        let mut rx = ctx.take_control_rx().unwrap();
        assert!(rx.try_recv().is_err(), "no control message expected");
    }

    #[test]
    fn test_user_registration_and_drop() {
        let ctx = ctx();
        let owner = WorkerInfo::new(WorkerId::new(1), "owner");
        let rref_id = RRefId::new(WorkerId::new(0), 0);
        let fork = RRefForkData {
            rref_id,
            fork_id: ForkId::new(rref_id, WorkerId::new(0), 1),
            owner: owner.clone(),
        };

        ctx.register_user(&fork).unwrap();
        assert_eq!(ctx.user_count(), 1);

        ctx.user_dropped(fork.fork_id);
        assert_eq!(ctx.user_count(), 0);

        let mut rx = ctx.take_control_rx().unwrap();
        match rx.try_recv().unwrap() {
            ControlNotify::Delete { owner: o, fork_id } => {
                assert_eq!(o, owner);
                assert_eq!(fork_id, fork.fork_id);
            }
            other => panic!("unexpected control message: {:?}", other),
        }
    }

    #[test]
    fn test_destroy_instance_invalidates_new_operations() {
        let ctx = ctx();
        let rref_id = ctx.next_rref_id();
        let pending = ctx.create_owner(rref_id, None).unwrap();

        ctx.destroy_instance();
        assert!(ctx.is_destroyed());
        assert_eq!(pending.try_result(), Some(Err(RpcError::ContextDestroyed)));

        assert_eq!(
            ctx.create_owner(ctx.next_rref_id(), None).unwrap_err(),
            RpcError::ContextDestroyed
        );
        assert_eq!(
            ctx.owner_value(rref_id).unwrap_err(),
            RpcError::ContextDestroyed
        );
        // Idempotent.
        ctx.destroy_instance();
    }
}
