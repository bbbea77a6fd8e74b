/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Distributed script calls: result futures, remote references, and the
//! dispatcher that ties them to a messaging layer.
//!
//! A worker calls a function on another worker either for its value, with
//! [`Dispatcher::dispatch_call`], or for a reference to a value the callee
//! keeps, with [`Dispatcher::dispatch_remote_call`]. Messages travel
//! through an [`RpcAgent`]; [`local::LocalNetwork`] provides one that
//! connects workers in the same process.

#[macro_use]
mod macros;

pub mod agent;
pub mod config;
pub mod error;
pub mod functions;
pub mod future;
pub mod local;
pub mod rref;
pub mod rref_context;
pub mod telemetry;
pub mod test_utils;

pub use agent::send_message_with_autograd;
pub use agent::GradientRecorder;
pub use agent::NoGradRecorder;
pub use agent::RpcAgent;
pub use config::Config;
pub use error::FutureError;
pub use error::RpcError;
pub use functions::Dispatcher;
pub use future::ResultFuture;
pub use local::FunctionTable;
pub use local::LocalAgent;
pub use local::LocalNetwork;
pub use rref::OwnerRRef;
pub use rref::RRefState;
pub use rref::UserRRef;
pub use rref_context::RRefContext;
pub use telemetry::initialize_logging;
