//! Remote-reference handles.
//!
//! An [`RRef`] names a value held by exactly one owning worker. The
//! handle plays one of two roles: owner-role handles live on the owning
//! worker and read the value locally; user-role handles live anywhere
//! else and fetch it over RPC. Dropping a handle feeds the distributed
//! refcounting protocol in [`context`].

pub mod context;

use crate::types::{ForkId, RRefForkData, RRefId, RpcError, RpcResult, Value, WorkerInfo};
use crate::worker::WorkerContext;
use std::sync::Weak;
use tracing::instrument;

/// Which side of the owner/user split a handle is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Owner,
    User,
}

/// A handle to a value owned by one worker in the cluster.
///
/// Handles are not `Clone`: each crossing of a process boundary mints a
/// distinct fork via [`RRef::export`], and each drop releases exactly one
/// fork or local handle.
pub struct RRef {
    id: RRefId,
    fork_id: ForkId,
    owner: WorkerInfo,
    role: Role,
    ctx: Weak<WorkerContext>,
}

impl RRef {
    pub(crate) fn new(
        ctx: Weak<WorkerContext>,
        id: RRefId,
        fork_id: ForkId,
        owner: WorkerInfo,
        role: Role,
    ) -> Self {
        Self {
            id,
            fork_id,
            owner,
            role,
            ctx,
        }
    }

    /// The reference's globally unique id.
    pub fn id(&self) -> RRefId {
        self.id
    }

    /// The fork this handle holds.
    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    /// Whether the calling worker owns the referenced value.
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// The worker that holds the referenced value.
    pub fn owner(&self) -> &WorkerInfo {
        &self.owner
    }

    fn context(&self) -> RpcResult<std::sync::Arc<WorkerContext>> {
        self.ctx.upgrade().ok_or(RpcError::Shutdown)
    }

    /// Materialize the referenced value on the calling worker.
    ///
    /// On the owner this waits for the local value to be ready; on a user
    /// it performs a fetch round trip to the owner. Concurrent calls are
    /// allowed and each returns the same value. If the producing
    /// computation failed, that error surfaces here.
    #[instrument(skip(self), fields(rref = %self.id))]
    pub async fn to_here(&self) -> RpcResult<Value> {
        let ctx = self.context()?;
        match self.role {
            Role::Owner => ctx.rrefs().owner_value(self.id)?.wait().await,
            Role::User => ctx.fetch_remote_value(&self.owner, self.id).await,
        }
    }

    /// Read the value without any network round trip.
    ///
    /// # Errors
    ///
    /// `NotOwner` if called on a user-role handle.
    pub async fn local_value(&self) -> RpcResult<Value> {
        let ctx = self.context()?;
        if self.role != Role::Owner {
            return Err(RpcError::NotOwner(ctx.worker_info().id));
        }
        ctx.rrefs().owner_value(self.id)?.wait().await
    }

    /// Serialize this handle for transfer to another worker.
    ///
    /// Mints a fresh fork and runs the sender half of the fork protocol;
    /// the receiving worker must pass the envelope to
    /// [`WorkerContext::import_rref`] to obtain a live handle. The fork
    /// envelope is the only valid cross-process representation of a
    /// handle.
    #[instrument(skip(self), fields(rref = %self.id))]
    pub fn export(&self) -> RpcResult<RRefForkData> {
        let ctx = self.context()?;
        let fork_id = ctx.rrefs().next_fork_id(self.id);
        let data = RRefForkData {
            rref_id: self.id,
            fork_id,
            owner: self.owner.clone(),
        };
        if self.role == Role::Owner {
            // Owner forks its own reference: record it directly.
            ctx.rrefs().add_fork(fork_id)?;
        } else {
            ctx.rrefs()
                .enqueue_fork_notify(data.clone(), ctx.worker_info().id)?;
        }
        Ok(data)
    }
}

impl std::fmt::Debug for RRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RRef")
            .field("id", &self.id)
            .field("fork_id", &self.fork_id)
            .field("owner", &self.owner)
            .field("role", &self.role)
            .finish()
    }
}

impl Drop for RRef {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            match self.role {
                Role::Owner => ctx.rrefs().release_local_handle(self.id),
                Role::User => ctx.rrefs().user_dropped(self.fork_id),
            }
        }
    }
}
