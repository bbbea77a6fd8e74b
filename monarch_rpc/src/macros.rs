/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Return an [`RpcError::Internal`](crate::RpcError::Internal) from the
/// enclosing function, logging it, unless `$cond` holds.
macro_rules! internal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let msg = format!($($arg)+);
            tracing::error!("{}", msg);
            return Err($crate::error::RpcError::Internal(msg));
        }
    };
}

/// Log and build an [`RpcError::Internal`](crate::RpcError::Internal).
macro_rules! internal_error {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        tracing::error!("{}", msg);
        $crate::error::RpcError::Internal(msg)
    }};
}
