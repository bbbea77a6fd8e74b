/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors raised by the RPC core.

use std::time::Duration;

use rpc_messages::MessageError;

/// Errors returned synchronously by RPC operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    /// The called function's declared signature cannot be used for this
    /// kind of call, or the arguments do not match it.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// An unknown worker name or id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A protocol or logic defect; unreachable in correct operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// The destination reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// An operation on an object in the wrong state, e.g. completing a
    /// future twice.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A request was not answered in time.
    #[error("request {0} timed out after {1:?}")]
    Timeout(u64, Duration),

    /// The agent or registry has been shut down.
    #[error("{0} is shut down")]
    Shutdown(String),
}

/// The error held by a completed [`crate::ResultFuture`]. Unlike
/// [`RpcError`] it is cheap to clone, so every callback can observe it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{what}")]
pub struct FutureError {
    what: String,
}

impl FutureError {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }

    /// The error text.
    pub fn what(&self) -> &str {
        &self.what
    }
}

impl From<RpcError> for FutureError {
    fn from(err: RpcError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<&RpcError> for FutureError {
    fn from(err: &RpcError) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            RpcError::InvalidSchema("two returns".into()).to_string(),
            "invalid schema: two returns"
        );
        assert_eq!(
            RpcError::Timeout(3, Duration::from_millis(1500)).to_string(),
            "request 3 timed out after 1.5s"
        );
        let err: FutureError = RpcError::Remote("boom".into()).into();
        assert_eq!(err.what(), "remote error: boom");
    }
}
