/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Script calls and remote references between workers of a local network.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use monarch_rpc::Config;
use monarch_rpc::FunctionTable;
use monarch_rpc::FutureError;
use monarch_rpc::LocalAgent;
use monarch_rpc::LocalNetwork;
use monarch_rpc::RRefState;
use monarch_rpc::RpcAgent;
use monarch_rpc::RpcError;
use rpc_messages::FunctionSchema;
use rpc_messages::Tensor;
use rpc_messages::ValueType;
use rpc_messages::WireValue;
use tracing::Level;

fn add_schema() -> FunctionSchema {
    "my_module.add(int a, int b) -> int".parse().unwrap()
}

fn make_tensor_schema() -> FunctionSchema {
    "my_module.make_tensor(List[int] shape) -> Tensor".parse().unwrap()
}

fn my_module() -> FunctionTable {
    let functions = FunctionTable::new();
    functions
        .register(add_schema(), |stack| match stack.as_slice() {
            [WireValue::Int(a), WireValue::Int(b)] => Ok(WireValue::Int(a + b)),
            _ => anyhow::bail!("add expects two ints"),
        })
        .unwrap();
    functions
        .register(make_tensor_schema(), |stack| {
            let shape = stack
                .first()
                .and_then(WireValue::as_int_list)
                .ok_or_else(|| anyhow::anyhow!("make_tensor expects a shape"))?
                .iter()
                .map(|dim| usize::try_from(*dim))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Tensor::zeros(shape)?.into())
        })
        .unwrap();
    functions
        .register("my_module.fail(int code) -> int".parse().unwrap(), |stack| {
            anyhow::bail!("failed with code {}", stack[0])
        })
        .unwrap();
    functions
}

async fn two_workers(config: Config) -> (Arc<LocalAgent>, Arc<LocalAgent>) {
    monarch_rpc::telemetry::set_tracing_env_filter(Level::DEBUG);
    let network = LocalNetwork::new();
    let worker0 = network
        .spawn_agent("worker0", my_module(), config.clone())
        .unwrap();
    let worker1 = network.spawn_agent("worker1", my_module(), config).unwrap();
    (worker0, worker1)
}

#[tokio::test]
async fn test_script_call() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let dispatcher = worker0.dispatcher();
    let schema = add_schema();

    let future = dispatcher
        .dispatch_call("worker1", schema.name(), &schema, vec![3i64.into(), 4i64.into()])
        .unwrap();
    let observed: Arc<Mutex<Option<(Option<WireValue>, Option<FutureError>)>>> =
        Arc::new(Mutex::new(None));
    let observed_clone = Arc::clone(&observed);
    future.add_callback(move |result| {
        let seen = match result {
            Ok(value) => (Some(value.clone()), None),
            Err(err) => (None, Some(err.clone())),
        };
        *observed_clone.lock().unwrap() = Some(seen);
    });

    assert_eq!(future.clone().await, Ok(WireValue::Int(7)));
    assert_eq!(
        *observed.lock().unwrap(),
        Some((Some(WireValue::Int(7)), None))
    );
    assert_eq!(worker0.num_outstanding(), 0);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_script_call_remote_exception() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let schema: FunctionSchema = "my_module.fail(int code) -> int".parse().unwrap();
    let future = worker0
        .dispatcher()
        .dispatch_call("worker1", schema.name(), &schema, vec![13i64.into()])
        .unwrap();
    let err = future.await.unwrap_err();
    assert!(err.what().contains("failed with code 13"), "{}", err);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_call() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let dispatcher = worker0.dispatcher();
    let schema = make_tensor_schema();

    let rref = dispatcher
        .dispatch_remote_call("worker1", schema.name(), &schema, vec![vec![2i64, 2].into()])
        .unwrap();
    assert_eq!(rref.owner(), worker1.worker_info().id);
    assert_eq!(rref.value_type(), &ValueType::Tensor);
    // Nothing has run yet on this single-threaded runtime: the reference
    // is pending and tracked under its fork id.
    assert!(rref.is_pending());
    assert_eq!(worker0.ctx().pending_fork_ids(), vec![rref.fork_id()]);

    rref.confirmed().await.unwrap();
    assert_eq!(rref.state(), RRefState::Confirmed);
    assert!(!worker0.ctx().is_pending(rref.fork_id()));
    assert_eq!(worker0.ctx().num_pending_users(), 0);

    let owner = worker1.ctx().get_owner_rref(rref.rref_id()).unwrap();
    let value = owner.value().await.unwrap();
    assert_eq!(value.as_tensor().unwrap().shape(), &[2, 2]);
    assert_eq!(worker1.ctx().num_forks(rref.rref_id()), 1);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_call_unknown_function_fails_reference() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let schema: FunctionSchema = "my_module.missing() -> Tensor".parse().unwrap();
    let rref = worker0
        .dispatcher()
        .dispatch_remote_call("worker1", schema.name(), &schema, vec![])
        .unwrap();
    let err = rref.confirmed().await.unwrap_err();
    assert!(err.what().contains("unknown function"), "{}", err);
    assert!(matches!(rref.state(), RRefState::Failed(_)));
    assert_eq!(worker0.ctx().num_pending_users(), 0);
    assert_eq!(worker1.ctx().num_owners(), 0);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_call_to_self() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let schema = make_tensor_schema();
    assert!(matches!(
        worker0
            .dispatcher()
            .dispatch_remote_call("worker0", schema.name(), &schema, vec![vec![1i64].into()]),
        Err(RpcError::Internal(_))
    ));
    assert_eq!(worker0.ctx().num_pending_users(), 0);
    assert_eq!(worker0.num_outstanding(), 0);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fork_ids_unique() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    let dispatcher = worker0.dispatcher();
    let schema = make_tensor_schema();

    let rrefs: Vec<_> = (0..16)
        .map(|_| {
            dispatcher
                .dispatch_remote_call("worker1", schema.name(), &schema, vec![vec![1i64].into()])
                .unwrap()
        })
        .collect();
    let forks: HashSet<_> = rrefs.iter().map(|rref| rref.fork_id()).collect();
    let ids: HashSet<_> = rrefs.iter().map(|rref| rref.rref_id()).collect();
    assert_eq!(forks.len(), 16);
    assert_eq!(ids.len(), 16);

    for rref in &rrefs {
        rref.confirmed().await.unwrap();
    }
    assert_eq!(worker0.ctx().num_pending_users(), 0);
    assert_eq!(worker1.ctx().num_owners(), 16);

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_to_stopped_worker() {
    let (worker0, worker1) = two_workers(Config::default()).await;
    worker1.shutdown().await.unwrap();

    let schema = add_schema();
    assert!(matches!(
        worker0
            .dispatcher()
            .dispatch_call("worker1", schema.name(), &schema, vec![1i64.into(), 2i64.into()]),
        Err(RpcError::Shutdown(_))
    ));

    let make = make_tensor_schema();
    assert!(worker0
        .dispatcher()
        .dispatch_remote_call("worker1", make.name(), &make, vec![vec![1i64].into()])
        .is_err());
    assert_eq!(worker0.ctx().num_pending_users(), 0);

    worker0.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_from_many_threads() {
    let (worker0, worker1) = two_workers(Config {
        rpc_timeout: Duration::from_secs(30),
        ..Config::default()
    })
    .await;
    let schema = add_schema();

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let dispatcher = worker0.dispatcher();
        let schema = schema.clone();
        handles.push(std::thread::spawn(move || {
            let future = dispatcher
                .dispatch_call("worker1", schema.name(), &schema, vec![i.into(), i.into()])
                .unwrap();
            let result = future.wait().cloned().map_err(Clone::clone);
            result
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let i = i as i64;
        assert_eq!(handle.join().unwrap(), Ok(WireValue::Int(2 * i)));
    }

    worker0.shutdown().await.unwrap();
    worker1.shutdown().await.unwrap();
}
