/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Single-assignment result futures.
//!
//! A [`ResultFuture`] is settled exactly once, with either a value or a
//! [`FutureError`]. Continuations registered with
//! [`ResultFuture::add_callback`] run exactly once, in registration order:
//! on the settling thread if registered before settlement, or immediately on
//! the registering thread otherwise. Waiters may block ([`ResultFuture::wait`])
//! or `.await` the future.
//!
//! ```
//! # use monarch_rpc::ResultFuture;
//! let future = ResultFuture::<i64>::new();
//! future.add_callback(|result| assert_eq!(result, Ok(&7)));
//! future.mark_completed(7).unwrap();
//! assert!(future.mark_completed(8).is_err());
//! assert_eq!(future.value(), Some(Ok(7)));
//! ```

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use rpc_messages::ValueType;
use tokio::sync::Notify;

use crate::error::FutureError;
use crate::error::RpcError;

type Callback<T> = Box<dyn FnOnce(Result<&T, &FutureError>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Completed,
}

struct Inner<T> {
    elem_type: Option<ValueType>,
    state: Mutex<State<T>>,
    // Written once, under `state`, just before the transition to `Completed`.
    outcome: OnceLock<Result<T, FutureError>>,
    completed: Condvar,
    notify: Notify,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let State::Pending(callbacks) = state {
            tracing::warn!(
                "result future of type {} dropped while pending; {} callbacks will never run",
                self.elem_type
                    .as_ref()
                    .map_or_else(|| "<untyped>".to_string(), ToString::to_string),
                callbacks.len(),
            );
        }
    }
}

/// A thread-safe, single-assignment container for the outcome of an
/// asynchronous operation. Clones share the same state.
pub struct ResultFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResultFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for ResultFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ResultFuture<T> {
    /// A pending future with no declared element type.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A pending future that will hold a value of type `elem_type`.
    pub fn with_type(elem_type: ValueType) -> Self {
        Self::build(Some(elem_type))
    }

    fn build(elem_type: Option<ValueType>) -> Self {
        Self {
            inner: Arc::new(Inner {
                elem_type,
                state: Mutex::new(State::Pending(Vec::new())),
                outcome: OnceLock::new(),
                completed: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A future already completed with `value`.
    pub fn ready(value: T) -> Self {
        let future = Self::new();
        let _ = future.mark_completed(value);
        future
    }

    /// A future already completed with `error`.
    pub fn from_error(error: impl Into<FutureError>) -> Self {
        let future = Self::new();
        let _ = future.set_error(error);
        future
    }

    /// The declared type of the value, if any.
    pub fn elem_type(&self) -> Option<&ValueType> {
        self.inner.elem_type.as_ref()
    }

    /// Whether the future has settled.
    pub fn completed(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Whether the future has settled with an error.
    pub fn has_error(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(Err(_)))
    }

    /// A borrowed view of the outcome, if settled.
    pub fn outcome(&self) -> Option<Result<&T, &FutureError>> {
        self.inner.outcome.get().map(Result::as_ref)
    }

    /// Register a continuation. If the future has already settled, `f` runs
    /// now, on this thread.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce(Result<&T, &FutureError>) + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if let State::Pending(callbacks) = &mut *state {
                callbacks.push(Box::new(f));
                return;
            }
        }
        if let Some(outcome) = self.inner.outcome.get() {
            f(outcome.as_ref());
        }
    }

    /// Settle the future with `value`. Fails with
    /// [`RpcError::IllegalState`] if it has already settled.
    pub fn mark_completed(&self, value: T) -> Result<(), RpcError> {
        self.settle(Ok(value))
    }

    /// Settle the future with `error`. Fails with
    /// [`RpcError::IllegalState`] if it has already settled.
    pub fn set_error(&self, error: impl Into<FutureError>) -> Result<(), RpcError> {
        self.settle(Err(error.into()))
    }

    fn settle(&self, outcome: Result<T, FutureError>) -> Result<(), RpcError> {
        let callbacks = {
            let mut state = self.inner.lock();
            let callbacks = match &mut *state {
                State::Completed => {
                    return Err(RpcError::IllegalState(
                        "result future completed more than once".to_string(),
                    ));
                }
                State::Pending(callbacks) => std::mem::take(callbacks),
            };
            if self.inner.outcome.set(outcome).is_err() {
                return Err(RpcError::IllegalState(
                    "result future outcome already set".to_string(),
                ));
            }
            *state = State::Completed;
            callbacks
        };

        self.inner.completed.notify_all();
        self.inner.notify.notify_waiters();

        if let Some(outcome) = self.inner.outcome.get() {
            for callback in callbacks {
                callback(outcome.as_ref());
            }
        }
        Ok(())
    }

    /// Block the calling thread until the future settles. Must not be called
    /// from an async context; `.await` the future instead.
    pub fn wait(&self) -> Result<&T, &FutureError> {
        let mut state = self.inner.lock();
        while matches!(*state, State::Pending(_)) {
            state = self
                .inner
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);
        match self.inner.outcome.get() {
            Some(outcome) => outcome.as_ref(),
            None => unreachable!("completed future without an outcome"),
        }
    }

    /// Like [`ResultFuture::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<&T, &FutureError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while matches!(*state, State::Pending(_)) {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = self
                .inner
                .completed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(state);
        self.outcome()
    }
}

impl<T: Clone + Send + Sync + 'static> ResultFuture<T> {
    /// A copy of the outcome, if settled.
    pub fn value(&self) -> Option<Result<T, FutureError>> {
        self.inner.outcome.get().cloned()
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for ResultFuture<T> {
    type Output = Result<T, FutureError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                // Register interest before checking, so a settlement between
                // the check and the await is not missed.
                notified.as_mut().enable();
                if let Some(outcome) = self.inner.outcome.get() {
                    return outcome.clone();
                }
                notified.await;
            }
        })
    }
}

impl<T> fmt::Debug for ResultFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFuture")
            .field("elem_type", &self.inner.elem_type)
            .field("completed", &self.inner.outcome.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;

    #[test]
    fn test_callbacks_run_in_order_on_completion() {
        let future = ResultFuture::<i64>::with_type(ValueType::Int);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            future.add_callback(move |result| {
                seen.lock().unwrap().push((i, *result.unwrap()));
            });
        }
        assert!(seen.lock().unwrap().is_empty());
        assert!(!future.completed());

        future.mark_completed(7).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(future.elem_type(), Some(&ValueType::Int));
    }

    #[test]
    fn test_callback_after_completion_runs_immediately() {
        let future = ResultFuture::ready("done".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        future.add_callback(move |result| {
            assert_eq!(result.unwrap(), "done");
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_settlement_rejected() {
        let future = ResultFuture::<i64>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        future.add_callback(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        future.set_error(FutureError::new("boom")).unwrap();
        assert!(matches!(
            future.mark_completed(1),
            Err(RpcError::IllegalState(_))
        ));
        assert!(matches!(
            future.set_error(FutureError::new("again")),
            Err(RpcError::IllegalState(_))
        ));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(future.has_error());
        assert_eq!(future.value(), Some(Err(FutureError::new("boom"))));
    }

    #[test]
    fn test_clones_share_state() {
        let future = ResultFuture::<i64>::new();
        let clone = future.clone();
        clone.mark_completed(3).unwrap();
        assert_eq!(future.outcome(), Some(Ok(&3)));
    }

    #[test]
    fn test_wait_across_threads() {
        let future = ResultFuture::<i64>::new();
        let setter = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.mark_completed(42).unwrap();
        });
        assert_eq!(future.wait(), Ok(&42));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let future = ResultFuture::<i64>::new();
        assert_eq!(future.wait_timeout(Duration::from_millis(10)), None);
        future.mark_completed(1).unwrap();
        assert_eq!(future.wait_timeout(Duration::from_millis(10)), Some(Ok(&1)));
    }

    #[test]
    fn test_concurrent_settlement_has_one_winner() {
        let future = ResultFuture::<usize>::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let future = future.clone();
                thread::spawn(move || future.mark_completed(i).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(future.completed());
    }

    #[tokio::test]
    async fn test_await() {
        let future = ResultFuture::<i64>::new();
        let setter = future.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            setter.mark_completed(5).unwrap();
        });
        assert_eq!(future.clone().await, Ok(5));
        // Awaiting a settled future returns immediately.
        assert_eq!(future.await, Ok(5));

        let failed = ResultFuture::<i64>::from_error(FutureError::new("nope"));
        assert_eq!(failed.await, Err(FutureError::new("nope")));
    }
}
