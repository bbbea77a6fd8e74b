/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Remote references.
//!
//! A [`UserRRef`] is held by a worker that does not own the referenced
//! value. It starts `Pending` and becomes `Confirmed` once the owner
//! acknowledges the fork. The owner keeps an [`OwnerRRef`] holding the
//! value itself.

use std::fmt;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use rpc_messages::ForkId;
use rpc_messages::RRefId;
use rpc_messages::ValueType;
use rpc_messages::WireValue;
use rpc_messages::WorkerId;

use crate::error::FutureError;
use crate::error::RpcError;
use crate::future::ResultFuture;

/// The lifecycle of a user reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RRefState {
    /// Created; the owner has not acknowledged it yet.
    Pending,
    /// The owner acknowledged the fork.
    Confirmed,
    /// The remote call or its acknowledgment failed.
    Failed(FutureError),
    /// Released while still pending, at registry shutdown.
    Retired,
}

impl RRefState {
    fn is_terminal(&self) -> bool {
        !matches!(self, RRefState::Pending)
    }
}

/// A handle to a value owned by another worker.
pub struct UserRRef {
    owner: WorkerId,
    rref_id: RRefId,
    fork_id: ForkId,
    value_type: ValueType,
    state: Mutex<RRefState>,
    confirmed: ResultFuture<()>,
}

impl UserRRef {
    pub(crate) fn new(
        owner: WorkerId,
        rref_id: RRefId,
        fork_id: ForkId,
        value_type: ValueType,
    ) -> Self {
        Self {
            owner,
            rref_id,
            fork_id,
            value_type,
            state: Mutex::new(RRefState::Pending),
            confirmed: ResultFuture::new(),
        }
    }

    /// The worker that owns the value.
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    /// The id of this particular copy of the reference.
    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    /// The declared type of the referenced value.
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    pub fn state(&self) -> RRefState {
        self.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        *self.lock() == RRefState::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        *self.lock() == RRefState::Confirmed
    }

    /// A future that settles when the reference leaves the pending state:
    /// with `()` on confirmation, or with the error that failed or retired
    /// it.
    pub fn confirmed(&self) -> ResultFuture<()> {
        self.confirmed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RRefState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: RRefState) -> Result<(), RpcError> {
        {
            let mut state = self.lock();
            if state.is_terminal() {
                return Err(RpcError::IllegalState(format!(
                    "{} is already {:?}",
                    self, *state
                )));
            }
            *state = next.clone();
        }
        match next {
            RRefState::Confirmed => self.confirmed.mark_completed(()),
            RRefState::Failed(err) => self.confirmed.set_error(err),
            RRefState::Retired => self
                .confirmed
                .set_error(FutureError::new(format!("{} retired while pending", self))),
            RRefState::Pending => Ok(()),
        }
    }

    /// Mark the reference as acknowledged by its owner.
    pub(crate) fn confirm(&self) -> Result<(), RpcError> {
        self.transition(RRefState::Confirmed)
    }

    pub(crate) fn fail(&self, err: FutureError) -> Result<(), RpcError> {
        self.transition(RRefState::Failed(err))
    }

    pub(crate) fn retire(&self) -> Result<(), RpcError> {
        self.transition(RRefState::Retired)
    }
}

impl fmt::Display for UserRRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserRRef({}, {}, owner {})", self.rref_id, self.fork_id, self.owner)
    }
}

impl fmt::Debug for UserRRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRRef")
            .field("owner", &self.owner)
            .field("rref_id", &self.rref_id)
            .field("fork_id", &self.fork_id)
            .field("value_type", &self.value_type)
            .field("state", &*self.lock())
            .finish()
    }
}

/// The owner's side of a remote reference: the value, once computed.
#[derive(Debug)]
pub struct OwnerRRef {
    rref_id: RRefId,
    value_type: ValueType,
    value: ResultFuture<WireValue>,
}

impl OwnerRRef {
    pub(crate) fn new(rref_id: RRefId, value_type: ValueType) -> Self {
        Self {
            rref_id,
            value: ResultFuture::with_type(value_type.clone()),
            value_type,
        }
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    /// The future of the referenced value.
    pub fn value(&self) -> ResultFuture<WireValue> {
        self.value.clone()
    }

    pub fn has_value(&self) -> bool {
        self.value.completed()
    }

    /// Store the computed value. Fails if a value or error was already
    /// stored, or if the value does not have the declared type.
    pub fn set_value(&self, value: WireValue) -> Result<(), RpcError> {
        if !self.value_type.admits(&value) {
            return Err(RpcError::InvalidSchema(format!(
                "{} expects a value of type {}, got {}",
                self.rref_id,
                self.value_type,
                value.value_type()
            )));
        }
        self.value.mark_completed(value)
    }

    pub fn set_error(&self, err: impl Into<FutureError>) -> Result<(), RpcError> {
        self.value.set_error(err)
    }
}

#[cfg(test)]
mod tests {
    use rpc_messages::GloballyUniqueId;
    use rpc_messages::Tensor;

    use super::*;

    fn user_rref() -> UserRRef {
        UserRRef::new(
            WorkerId(1),
            RRefId(GloballyUniqueId::new(WorkerId(0), 0)),
            ForkId(GloballyUniqueId::new(WorkerId(0), 1)),
            ValueType::Tensor,
        )
    }

    #[test]
    fn test_confirm() {
        let rref = user_rref();
        assert!(rref.is_pending());
        assert!(!rref.confirmed().completed());

        rref.confirm().unwrap();
        assert!(rref.is_confirmed());
        assert_eq!(rref.confirmed().value(), Some(Ok(())));

        assert!(matches!(rref.confirm(), Err(RpcError::IllegalState(_))));
        assert!(matches!(
            rref.fail(FutureError::new("late")),
            Err(RpcError::IllegalState(_))
        ));
        assert!(rref.is_confirmed());
    }

    #[test]
    fn test_fail_and_retire() {
        let rref = user_rref();
        rref.fail(FutureError::new("owner died")).unwrap();
        assert_eq!(rref.state(), RRefState::Failed(FutureError::new("owner died")));
        assert!(rref.confirmed().has_error());

        let rref = user_rref();
        rref.retire().unwrap();
        assert_eq!(rref.state(), RRefState::Retired);
        assert!(rref.confirmed().has_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            user_rref().to_string(),
            "UserRRef(rref:GUID(0, 0), fork:GUID(0, 1), owner 1)"
        );
    }

    #[test]
    fn test_owner_value() {
        let owner = OwnerRRef::new(RRefId(GloballyUniqueId::new(WorkerId(0), 0)), ValueType::Tensor);
        assert!(!owner.has_value());
        assert!(matches!(
            owner.set_value(WireValue::Int(1)),
            Err(RpcError::InvalidSchema(_))
        ));
        assert!(!owner.has_value());

        owner.set_value(Tensor::zeros(vec![2]).unwrap().into()).unwrap();
        assert!(owner.has_value());
        assert!(matches!(
            owner.set_value(Tensor::zeros(vec![2]).unwrap().into()),
            Err(RpcError::IllegalState(_))
        ));
    }
}
