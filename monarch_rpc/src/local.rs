/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process RPC network.
//!
//! A [`LocalNetwork`] connects workers living in the same process. Each
//! [`LocalAgent`] serves script calls against its [`FunctionTable`], acting
//! as owner for remote calls, and delivers requests to its peers as encoded
//! messages over unbounded channels.

use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rpc_messages::FunctionSchema;
use rpc_messages::Message;
use rpc_messages::MessageType;
use rpc_messages::QualifiedName;
use rpc_messages::RemoteRet;
use rpc_messages::RpcCommand;
use rpc_messages::ScriptCall;
use rpc_messages::ScriptRemoteCall;
use rpc_messages::ScriptResp;
use rpc_messages::ValueType;
use rpc_messages::WireValue;
use rpc_messages::WorkerId;
use rpc_messages::WorkerInfo;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::agent::RpcAgent;
use crate::config::Config;
use crate::error::FutureError;
use crate::error::RpcError;
use crate::functions::check_arguments;
use crate::functions::single_return_type;
use crate::functions::Dispatcher;
use crate::future::ResultFuture;
use crate::rref_context::RRefContext;

/// The body of a script function.
pub type ScriptFn = Arc<dyn Fn(Vec<WireValue>) -> anyhow::Result<WireValue> + Send + Sync>;

/// Script functions a worker can serve, by qualified name. Clones share
/// the same table.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: Arc<DashMap<QualifiedName, (FunctionSchema, ScriptFn)>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under the name of `schema`.
    pub fn register<F>(&self, schema: FunctionSchema, f: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<WireValue>) -> anyhow::Result<WireValue> + Send + Sync + 'static,
    {
        match self.functions.entry(schema.name().clone()) {
            Entry::Occupied(entry) => Err(RpcError::IllegalState(format!(
                "function {} is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert((schema, Arc::new(f)));
                Ok(())
            }
        }
    }

    pub fn schema(&self, name: &QualifiedName) -> Option<FunctionSchema> {
        self.functions.get(name).map(|entry| entry.0.clone())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn get(&self, name: &QualifiedName) -> anyhow::Result<(FunctionSchema, ScriptFn)> {
        self.functions
            .get(name)
            .map(|entry| (entry.0.clone(), Arc::clone(&entry.1)))
            .ok_or_else(|| anyhow::anyhow!("unknown function {}", name))
    }

    /// Run the function named by `call`, checking its arguments and return
    /// value against the registered schema. A panicking function is
    /// reported as an error.
    fn invoke(&self, call: ScriptCall) -> anyhow::Result<WireValue> {
        let (name, stack) = call.into_parts();
        let (schema, f) = self.get(&name)?;
        check_arguments(&schema, &stack)?;
        let value = match panic::catch_unwind(AssertUnwindSafe(|| f(stack))) {
            Ok(result) => result?,
            Err(payload) => {
                let what = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("panic cannot be downcast");
                anyhow::bail!("{} panicked: {}", name, what);
            }
        };
        if let [ret] = schema.returns() {
            anyhow::ensure!(
                ret.ty.admits(&value),
                "{} returned {} where {} was declared",
                name,
                value.value_type(),
                ret.ty
            );
        }
        Ok(value)
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.functions.iter().map(|entry| entry.key().clone()))
            .finish()
    }
}

/// A request in flight between two local agents.
struct Envelope {
    from: WorkerInfo,
    bytes: Vec<u8>,
    reply: ResultFuture<Message>,
}

/// Workers of one in-process group.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    by_name: DashMap<String, WorkerInfo>,
    by_id: DashMap<WorkerId, WorkerInfo>,
    inboxes: DashMap<WorkerId, mpsc::UnboundedSender<Envelope>>,
    next_worker_id: AtomicU16,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("from", &self.from)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a worker called `name` that serves `functions`. Must be called
    /// from within a tokio runtime.
    pub fn spawn_agent(
        self: &Arc<Self>,
        name: &str,
        functions: FunctionTable,
        config: Config,
    ) -> Result<Arc<LocalAgent>, RpcError> {
        let runtime = Handle::try_current()
            .map_err(|err| RpcError::IllegalState(format!("no tokio runtime: {}", err)))?;

        let info = match self.by_name.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(RpcError::IllegalState(format!(
                    "worker name {} is already taken",
                    name
                )));
            }
            Entry::Vacant(entry) => {
                let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
                let info = WorkerInfo::new(name, id);
                entry.insert(info.clone());
                info
            }
        };
        self.by_id.insert(info.id, info.clone());

        let ctx = Arc::new(RRefContext::new(info.id));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(info.id, tx);

        let server = Server {
            info: info.clone(),
            ctx: Arc::clone(&ctx),
            functions,
        };
        let serve = runtime.spawn(
            Arc::new(server)
                .serve(rx)
                .instrument(tracing::debug_span!("serve", worker = %info)),
        );
        tracing::debug!("started local agent {}", info);

        Ok(Arc::new(LocalAgent {
            info,
            network: Arc::clone(self),
            ctx,
            config,
            runtime,
            next_message_id: AtomicU64::new(0),
            outstanding: Arc::new(DashMap::new()),
            serve: Mutex::new(Some(serve)),
        }))
    }

    fn worker_by_name(&self, name: &str) -> Result<WorkerInfo, RpcError> {
        self.by_name
            .get(name)
            .map(|info| info.value().clone())
            .ok_or_else(|| RpcError::NotFound(format!("unknown worker {}", name)))
    }

    fn worker_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError> {
        self.by_id
            .get(&id)
            .map(|info| info.value().clone())
            .ok_or_else(|| RpcError::NotFound(format!("unknown worker id {}", id)))
    }
}

/// The receiving side of a local agent.
struct Server {
    info: WorkerInfo,
    ctx: Arc<RRefContext>,
    functions: FunctionTable,
}

impl Server {
    /// Serve requests one at a time. Function bodies run on the blocking
    /// pool so that they never stall the runtime's workers.
    async fn serve(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let server = Arc::clone(&self);
            let from = envelope.from;
            let bytes = envelope.bytes;
            let span = tracing::Span::current();
            let response = tokio::task::spawn_blocking(move || {
                span.in_scope(|| server.respond(&from, &bytes))
            })
            .await
            .unwrap_or_else(|err| Message::exception(format!("request handler failed: {}", err)));
            if let Err(err) = envelope.reply.mark_completed(response) {
                // The sender gave up on the request, e.g. after a timeout.
                tracing::debug!("dropping reply: {}", err);
            }
        }
        tracing::debug!("worker {} stopped serving", self.info);
    }

    fn respond(&self, from: &WorkerInfo, bytes: &[u8]) -> Message {
        match Message::from_bytes(bytes) {
            Ok(request) => {
                let id = request.id();
                let mut response = self.handle(from, request);
                response.set_id(id);
                response
            }
            Err(err) => Message::exception(format!("undecodable request: {}", err)),
        }
    }

    fn handle(&self, from: &WorkerInfo, request: Message) -> Message {
        let result = match request.kind() {
            MessageType::ScriptCall => self.handle_script_call(&request),
            MessageType::ScriptRemoteCall => self.handle_script_remote_call(&request),
            kind => Err(anyhow::anyhow!("{} cannot handle {} messages", self.info, kind)),
        };
        result.unwrap_or_else(|err| {
            tracing::debug!("request from {} failed: {:#}", from, err);
            Message::exception(format!("{:#}", err))
        })
    }

    fn handle_script_call(&self, request: &Message) -> anyhow::Result<Message> {
        let call = ScriptCall::from_message(request)?;
        let value = self.functions.invoke(call)?;
        Ok(ScriptResp::new(value).into_message()?)
    }

    /// Run the call, keep its outcome in the owner reference, and
    /// acknowledge the caller's fork.
    fn handle_script_remote_call(&self, request: &Message) -> anyhow::Result<Message> {
        let (call, rref_id, fork_id) = ScriptRemoteCall::from_message(request)?.into_parts();
        let schema = self
            .functions
            .schema(call.qualified_name())
            .ok_or_else(|| anyhow::anyhow!("unknown function {}", call.qualified_name()))?;
        let value_type = single_return_type(&schema).unwrap_or(ValueType::Any);

        let owner = self.ctx.get_or_create_owner_rref(rref_id, value_type)?;
        let stored = match self.functions.invoke(call) {
            Ok(value) => owner.set_value(value),
            Err(err) => owner.set_error(FutureError::new(format!("{:#}", err))),
        };
        if let Err(err) = stored {
            owner.set_error(&err).ok();
        }
        self.ctx.add_fork_of_owner(rref_id, fork_id)?;
        Ok(RemoteRet::new(rref_id, fork_id).into_message()?)
    }
}

/// An [`RpcAgent`] for a worker of a [`LocalNetwork`].
pub struct LocalAgent {
    info: WorkerInfo,
    network: Arc<LocalNetwork>,
    ctx: Arc<RRefContext>,
    config: Config,
    runtime: Handle,
    next_message_id: AtomicU64,
    outstanding: Arc<DashMap<u64, ResultFuture<Message>>>,
    serve: Mutex<Option<JoinHandle<()>>>,
}

impl LocalAgent {
    /// This worker's remote reference registry.
    pub fn ctx(&self) -> &Arc<RRefContext> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Requests sent and not yet answered.
    pub fn num_outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// A dispatcher sending through this agent.
    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        Dispatcher::new(Arc::clone(self) as Arc<dyn RpcAgent>, Arc::clone(&self.ctx))
    }
}

impl fmt::Debug for LocalAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAgent")
            .field("info", &self.info)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

#[async_trait]
impl RpcAgent for LocalAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.info
    }

    fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError> {
        self.network.worker_by_name(name)
    }

    fn get_worker_info_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError> {
        self.network.worker_by_id(id)
    }

    fn send(&self, to: &WorkerInfo, mut message: Message) -> Result<ResultFuture<Message>, RpcError> {
        let inbox = match self.network.inboxes.get(&to.id) {
            Some(inbox) => inbox.value().clone(),
            None => {
                self.network.worker_by_id(to.id)?;
                return Err(RpcError::Shutdown(format!("worker {}", to)));
            }
        };

        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        message.set_id(id);
        let bytes = message.to_bytes()?;

        let reply = ResultFuture::new();
        self.outstanding.insert(id, reply.clone());
        let outstanding = Arc::clone(&self.outstanding);
        reply.add_callback(move |_| {
            outstanding.remove(&id);
        });

        let envelope = Envelope {
            from: self.info.clone(),
            bytes,
            reply: reply.clone(),
        };
        if inbox.send(envelope).is_err() {
            let err = RpcError::Shutdown(format!("worker {}", to));
            let _ = reply.set_error(&err);
            return Err(err);
        }

        if let Some(timeout) = self.config.timeout() {
            let pending = reply.clone();
            self.runtime.spawn(async move {
                if tokio::time::timeout(timeout, pending.clone()).await.is_err() {
                    let _ = pending.set_error(RpcError::Timeout(id, timeout));
                }
            });
        }
        Ok(reply)
    }

    async fn shutdown(&self) -> Result<(), RpcError> {
        self.network.inboxes.remove(&self.info.id);
        let serve = self
            .serve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(serve) = serve {
            serve
                .await
                .map_err(|err| RpcError::Internal(format!("serve loop of {} failed: {}", self.info, err)))?;
        }

        let outstanding: Vec<ResultFuture<Message>> = self
            .outstanding
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for reply in outstanding {
            let _ = reply.set_error(RpcError::Shutdown(format!("agent {}", self.info)));
        }

        tracing::debug!("shut down local agent {}", self.info);
        self.ctx.shutdown(self.config.check_rref_leaks)
    }
}
