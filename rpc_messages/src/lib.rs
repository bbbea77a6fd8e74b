/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wire data for script RPCs: the value interchange type, declared types
//! and function schemas, worker and reference ids, call descriptors, and
//! the message envelope they travel in.

pub mod ids;
pub mod message;
pub mod parse;
pub mod schema;
pub mod script_call;
pub mod value;

pub use ids::ForkId;
pub use ids::GloballyUniqueId;
pub use ids::RRefId;
pub use ids::WorkerId;
pub use ids::WorkerInfo;
pub use message::Message;
pub use message::MessageError;
pub use message::MessageType;
pub use message::RpcCommand;
pub use schema::Argument;
pub use schema::FunctionSchema;
pub use schema::QualifiedName;
pub use script_call::RemoteRet;
pub use script_call::ScriptCall;
pub use script_call::ScriptRemoteCall;
pub use script_call::ScriptResp;
pub use value::ShapeError;
pub use value::Tensor;
pub use value::ValueType;
pub use value::WireValue;
