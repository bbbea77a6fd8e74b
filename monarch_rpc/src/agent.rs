/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The messaging layer seen by the dispatcher.

use async_trait::async_trait;
use rpc_messages::Message;
use rpc_messages::WorkerId;
use rpc_messages::WorkerInfo;

use crate::error::RpcError;
use crate::future::ResultFuture;

/// A worker's endpoint in the RPC network. Agents deliver messages to
/// other workers and hand back a future of the response.
#[async_trait]
pub trait RpcAgent: Send + Sync {
    /// This worker.
    fn worker_info(&self) -> &WorkerInfo;

    /// Resolve a worker by name.
    fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError>;

    /// Resolve a worker by id.
    fn get_worker_info_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError>;

    /// Send `message` to `to`. The returned future settles with the
    /// response, or with an error if the request fails or times out. An
    /// error returned here means nothing was sent.
    fn send(&self, to: &WorkerInfo, message: Message) -> Result<ResultFuture<Message>, RpcError>;

    /// Stop serving and fail every outstanding request.
    async fn shutdown(&self) -> Result<(), RpcError>;
}

/// Bookkeeping applied to outgoing messages that participate in gradient
/// recording.
pub trait GradientRecorder: Send + Sync {
    /// Record `message` as sent to `to`, returning the message to send.
    fn record(&self, message: Message, to: &WorkerInfo, force_grad_recording: bool) -> Message;
}

/// A recorder that passes messages through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGradRecorder;

impl GradientRecorder for NoGradRecorder {
    fn record(&self, message: Message, _to: &WorkerInfo, _force_grad_recording: bool) -> Message {
        message
    }
}

/// Send `message` to `to` through `agent`, after giving `recorder` the
/// chance to attach gradient bookkeeping.
pub fn send_message_with_autograd(
    agent: &dyn RpcAgent,
    to: &WorkerInfo,
    message: Message,
    force_grad_recording: bool,
    recorder: &dyn GradientRecorder,
) -> Result<ResultFuture<Message>, RpcError> {
    let message = recorder.record(message, to, force_grad_recording);
    agent.send(to, message)
}
