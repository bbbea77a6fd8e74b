/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Call descriptors and their replies.

use serde::Deserialize;
use serde::Serialize;

use crate::ids::ForkId;
use crate::ids::RRefId;
use crate::message::MessageType;
use crate::message::RpcCommand;
use crate::schema::QualifiedName;
use crate::value::WireValue;

/// A call of a script function with a stack of arguments. A call is
/// consumed when it is turned into a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScriptCall {
    qualified_name: QualifiedName,
    stack: Vec<WireValue>,
}

impl ScriptCall {
    pub fn new(qualified_name: QualifiedName, stack: Vec<WireValue>) -> Self {
        Self {
            qualified_name,
            stack,
        }
    }

    pub fn qualified_name(&self) -> &QualifiedName {
        &self.qualified_name
    }

    pub fn stack(&self) -> &[WireValue] {
        &self.stack
    }

    /// Split the call into its function name and argument stack.
    pub fn into_parts(self) -> (QualifiedName, Vec<WireValue>) {
        (self.qualified_name, self.stack)
    }
}

impl RpcCommand for ScriptCall {
    const KIND: MessageType = MessageType::ScriptCall;
}

/// A script call whose result stays on the callee, which becomes the owner
/// of the remote reference `rref_id`. `fork_id` names the caller's copy.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScriptRemoteCall {
    call: ScriptCall,
    rref_id: RRefId,
    fork_id: ForkId,
}

impl ScriptRemoteCall {
    pub fn new(
        qualified_name: QualifiedName,
        stack: Vec<WireValue>,
        rref_id: RRefId,
        fork_id: ForkId,
    ) -> Self {
        Self {
            call: ScriptCall::new(qualified_name, stack),
            rref_id,
            fork_id,
        }
    }

    pub fn call(&self) -> &ScriptCall {
        &self.call
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    pub fn into_parts(self) -> (ScriptCall, RRefId, ForkId) {
        (self.call, self.rref_id, self.fork_id)
    }
}

impl RpcCommand for ScriptRemoteCall {
    const KIND: MessageType = MessageType::ScriptRemoteCall;
}

/// The value returned by a [`ScriptCall`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScriptResp {
    value: WireValue,
}

impl ScriptResp {
    pub fn new(value: WireValue) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &WireValue {
        &self.value
    }

    pub fn into_value(self) -> WireValue {
        self.value
    }
}

impl RpcCommand for ScriptResp {
    const KIND: MessageType = MessageType::ScriptRet;
}

/// The owner's acknowledgment of a [`ScriptRemoteCall`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRet {
    rref_id: RRefId,
    fork_id: ForkId,
}

impl RemoteRet {
    pub fn new(rref_id: RRefId, fork_id: ForkId) -> Self {
        Self { rref_id, fork_id }
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }
}

impl RpcCommand for RemoteRet {
    const KIND: MessageType = MessageType::RemoteRet;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GloballyUniqueId;
    use crate::ids::WorkerId;
    use crate::message::MessageError;
    use crate::value::Tensor;

    fn ids() -> (RRefId, ForkId) {
        (
            RRefId(GloballyUniqueId::new(WorkerId(1), 0)),
            ForkId(GloballyUniqueId::new(WorkerId(1), 1)),
        )
    }

    #[test]
    fn test_script_call_message() {
        let call = ScriptCall::new("m.add".into(), vec![3i64.into(), 4i64.into()]);
        let message = call.clone().into_message().unwrap();
        assert_eq!(message.kind(), MessageType::ScriptCall);
        assert_eq!(ScriptCall::from_message(&message).unwrap(), call);
    }

    #[test]
    fn test_remote_call_carries_ids() {
        let (rref_id, fork_id) = ids();
        let call = ScriptRemoteCall::new(
            "m.make_tensor".into(),
            vec![vec![2i64, 2].into()],
            rref_id,
            fork_id,
        );
        let decoded = ScriptRemoteCall::from_message(&call.into_message().unwrap()).unwrap();
        assert_eq!(decoded.rref_id(), rref_id);
        assert_eq!(decoded.fork_id(), fork_id);
        assert_eq!(decoded.call().qualified_name().name(), "make_tensor");
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let message = ScriptResp::new(Tensor::zeros(vec![1]).unwrap().into())
            .into_message()
            .unwrap();
        let err = RemoteRet::from_message(&message).unwrap_err();
        assert!(matches!(
            err,
            MessageError::UnexpectedType {
                expected: MessageType::RemoteRet,
                actual: MessageType::ScriptRet,
            }
        ));
        assert!(ScriptResp::from_message(&message).is_ok());
    }
}
