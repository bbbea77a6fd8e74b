/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-worker remote reference registry.
//!
//! [`RRefContext`] mints globally unique ids, creates user references, and
//! tracks the ones whose creation the owner has not yet acknowledged. On
//! the owning side it keeps the owner references and the forks they have
//! handed out.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rpc_messages::ForkId;
use rpc_messages::GloballyUniqueId;
use rpc_messages::Message;
use rpc_messages::RRefId;
use rpc_messages::RemoteRet;
use rpc_messages::RpcCommand;
use rpc_messages::ValueType;
use rpc_messages::WorkerId;

use crate::error::FutureError;
use crate::error::RpcError;
use crate::rref::OwnerRRef;
use crate::rref::UserRRef;

/// Remote reference state of one worker. Shared by the dispatcher, the
/// agent and the continuations they register.
#[derive(Debug)]
pub struct RRefContext {
    worker_id: WorkerId,
    next_local_id: AtomicU64,
    /// User references awaiting their owner's acknowledgment, by fork.
    pending_users: DashMap<ForkId, Arc<UserRRef>>,
    owners: DashMap<RRefId, Arc<OwnerRRef>>,
    forks: DashMap<RRefId, HashSet<ForkId>>,
    destroyed: AtomicBool,
}

impl RRefContext {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            next_local_id: AtomicU64::new(0),
            pending_users: DashMap::new(),
            owners: DashMap::new(),
            forks: DashMap::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The worker this registry belongs to.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Mint an id that is unique across the group for the lifetime of this
    /// registry.
    pub fn gen_globally_unique_id(&self) -> GloballyUniqueId {
        GloballyUniqueId::new(
            self.worker_id,
            self.next_local_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn check_alive(&self) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown(format!(
                "rref context of worker {}",
                self.worker_id
            )));
        }
        Ok(())
    }

    /// Create a user reference to a value of type `value_type` that `owner`
    /// will hold. The reference is not registered as pending.
    pub fn create_user_rref(
        &self,
        owner: WorkerId,
        value_type: ValueType,
    ) -> Result<Arc<UserRRef>, RpcError> {
        self.check_alive()?;
        internal_assert!(
            owner != self.worker_id,
            "cannot create a user rref on worker {} for a value it owns",
            owner
        );
        let rref_id = RRefId(self.gen_globally_unique_id());
        let fork_id = ForkId(self.gen_globally_unique_id());
        Ok(Arc::new(UserRRef::new(owner, rref_id, fork_id, value_type)))
    }

    /// Track `rref` until its owner acknowledges `fork_id`.
    pub fn add_pending_user(&self, fork_id: ForkId, rref: Arc<UserRRef>) -> Result<(), RpcError> {
        self.check_alive()?;
        match self.pending_users.entry(fork_id) {
            Entry::Occupied(_) => {
                return Err(internal_error!(
                    "inconsistent states: attempt to add the same user rref fork {} twice",
                    fork_id
                ));
            }
            Entry::Vacant(entry) => {
                tracing::debug!("added pending user {}", rref);
                entry.insert(rref);
            }
        }
        // Shutdown marks the registry destroyed before it drains the table,
        // so an entry inserted concurrently is either drained or removed here.
        if let Err(err) = self.check_alive() {
            if let Some((_, rref)) = self.pending_users.remove(&fork_id) {
                let _ = rref.retire();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Handle the response to a remote call: decode the owner's
    /// acknowledgment and confirm the user reference it names.
    pub fn confirm_pending_user(&self, result: Result<&Message, &FutureError>) -> Result<(), RpcError> {
        let message = result.map_err(|err| RpcError::Remote(err.what().to_string()))?;
        if let Some(what) = message.exception_text() {
            return Err(RpcError::Remote(what));
        }
        let ack = RemoteRet::from_message(message)?;
        let rref_id = match self.pending_users.get(&ack.fork_id()) {
            Some(rref) => rref.rref_id(),
            None => {
                return Err(internal_error!(
                    "received an acknowledgment for unknown user rref fork {}",
                    ack.fork_id()
                ));
            }
        };
        internal_assert!(
            rref_id == ack.rref_id(),
            "acknowledgment for fork {} names {}, but the pending user holds {}",
            ack.fork_id(),
            ack.rref_id(),
            rref_id
        );
        self.del_pending_user(ack.fork_id())
    }

    /// Confirm the pending user reference `fork_id` and stop tracking it.
    /// An unknown fork is an internal error and leaves the table untouched.
    pub fn del_pending_user(&self, fork_id: ForkId) -> Result<(), RpcError> {
        let Some((_, rref)) = self.pending_users.remove(&fork_id) else {
            return Err(internal_error!(
                "inconsistent states: attempt to delete a non-existent user rref fork {}",
                fork_id
            ));
        };
        rref.confirm()?;
        tracing::debug!("confirmed user {}", rref);
        Ok(())
    }

    /// Fail the pending user reference `fork_id` and stop tracking it.
    pub fn fail_pending_user(&self, fork_id: ForkId, err: FutureError) -> Result<(), RpcError> {
        let Some((_, rref)) = self.pending_users.remove(&fork_id) else {
            return Err(internal_error!(
                "attempt to fail a non-existent user rref fork {}",
                fork_id
            ));
        };
        tracing::warn!("user {} failed: {}", rref, err);
        rref.fail(err)
    }

    pub fn is_pending(&self, fork_id: ForkId) -> bool {
        self.pending_users.contains_key(&fork_id)
    }

    pub fn num_pending_users(&self) -> usize {
        self.pending_users.len()
    }

    /// The forks currently awaiting acknowledgment, in no particular order.
    pub fn pending_fork_ids(&self) -> Vec<ForkId> {
        self.pending_users.iter().map(|entry| *entry.key()).collect()
    }

    /// The owner reference for `rref_id`, created on first use.
    pub fn get_or_create_owner_rref(
        &self,
        rref_id: RRefId,
        value_type: ValueType,
    ) -> Result<Arc<OwnerRRef>, RpcError> {
        self.check_alive()?;
        Ok(self
            .owners
            .entry(rref_id)
            .or_insert_with(|| Arc::new(OwnerRRef::new(rref_id, value_type)))
            .value()
            .clone())
    }

    pub fn get_owner_rref(&self, rref_id: RRefId) -> Option<Arc<OwnerRRef>> {
        self.owners.get(&rref_id).map(|owner| Arc::clone(&owner))
    }

    /// Record that the owner reference `rref_id` was forked as `fork_id`.
    pub fn add_fork_of_owner(&self, rref_id: RRefId, fork_id: ForkId) -> Result<(), RpcError> {
        self.check_alive()?;
        let added = self.forks.entry(rref_id).or_default().insert(fork_id);
        internal_assert!(
            added,
            "got fork {} of {} twice",
            fork_id,
            rref_id
        );
        Ok(())
    }

    pub fn num_forks(&self, rref_id: RRefId) -> usize {
        self.forks.get(&rref_id).map_or(0, |forks| forks.len())
    }

    pub fn num_owners(&self) -> usize {
        self.owners.len()
    }

    /// Tear the registry down. Pending user references are retired and
    /// owner values not yet computed fail. With `check_leaks`, pending user
    /// references are reported as an internal error.
    pub fn shutdown(&self, check_leaks: bool) -> Result<(), RpcError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut leaked = self.pending_fork_ids();
        leaked.sort();
        for fork_id in &leaked {
            if let Some((_, rref)) = self.pending_users.remove(fork_id) {
                let _ = rref.retire();
            }
        }

        let owners: Vec<Arc<OwnerRRef>> = self
            .owners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.owners.clear();
        self.forks.clear();
        for owner in owners {
            if !owner.has_value() {
                let _ = owner.set_error(FutureError::new(format!(
                    "worker {} shut down before computing {}",
                    self.worker_id,
                    owner.rref_id()
                )));
            }
        }

        if check_leaks && !leaked.is_empty() {
            let leaked: Vec<String> = leaked.iter().map(ToString::to_string).collect();
            return Err(internal_error!(
                "worker {} leaked {} pending user rrefs: {}",
                self.worker_id,
                leaked.len(),
                leaked.join(", ")
            ));
        }
        Ok(())
    }
}
