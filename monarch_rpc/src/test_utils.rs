/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test doubles for the messaging layer.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use rpc_messages::Message;
use rpc_messages::WorkerId;
use rpc_messages::WorkerInfo;

use crate::agent::GradientRecorder;
use crate::agent::RpcAgent;
use crate::error::RpcError;
use crate::future::ResultFuture;

/// A message captured by [`MockAgent`], with the future its sender is
/// waiting on. Settle `response` to simulate the reply.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: WorkerInfo,
    pub message: Message,
    pub response: ResultFuture<Message>,
}

/// An agent that records what it is asked to send instead of delivering
/// it.
#[derive(Debug)]
pub struct MockAgent {
    info: WorkerInfo,
    workers: Vec<WorkerInfo>,
    sent: Mutex<Vec<SentMessage>>,
    fail_sends: AtomicBool,
}

impl MockAgent {
    /// An agent for worker `info` that knows itself and `peers`.
    pub fn new(info: WorkerInfo, peers: Vec<WorkerInfo>) -> Self {
        let mut workers = vec![info.clone()];
        workers.extend(peers);
        Self {
            info,
            workers,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Make subsequent sends fail synchronously.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn num_sent(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drain the captured messages, oldest first.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl RpcAgent for MockAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.info
    }

    fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError> {
        self.workers
            .iter()
            .find(|worker| worker.name == name)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("unknown worker {}", name)))
    }

    fn get_worker_info_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError> {
        self.workers
            .iter()
            .find(|worker| worker.id == id)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("unknown worker id {}", id)))
    }

    fn send(&self, to: &WorkerInfo, message: Message) -> Result<ResultFuture<Message>, RpcError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown(format!("mock agent {}", self.info)));
        }
        let response = ResultFuture::new();
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                to: to.clone(),
                message,
                response: response.clone(),
            });
        Ok(response)
    }

    async fn shutdown(&self) -> Result<(), RpcError> {
        Ok(())
    }
}

/// A gradient recorder that counts the messages it sees.
#[derive(Debug, Default)]
pub struct CountingRecorder {
    recorded: AtomicUsize,
    forced: AtomicUsize,
}

impl CountingRecorder {
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::SeqCst)
    }

    /// How many of the recorded messages forced gradient recording.
    pub fn forced(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }
}

impl GradientRecorder for CountingRecorder {
    fn record(&self, message: Message, _to: &WorkerInfo, force_grad_recording: bool) -> Message {
        self.recorded.fetch_add(1, Ordering::SeqCst);
        if force_grad_recording {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        message
    }
}
