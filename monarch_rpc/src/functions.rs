/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Script call dispatch.
//!
//! [`Dispatcher::dispatch_call`] sends a script call and returns a typed
//! [`ResultFuture`] of its value. [`Dispatcher::dispatch_remote_call`]
//! leaves the value on the callee and returns a [`UserRRef`] that is
//! confirmed once the callee acknowledges it.

use std::sync::Arc;

use rpc_messages::FunctionSchema;
use rpc_messages::Message;
use rpc_messages::QualifiedName;
use rpc_messages::RpcCommand;
use rpc_messages::ScriptCall;
use rpc_messages::ScriptRemoteCall;
use rpc_messages::ScriptResp;
use rpc_messages::ValueType;
use rpc_messages::WireValue;

use crate::agent::send_message_with_autograd;
use crate::agent::GradientRecorder;
use crate::agent::NoGradRecorder;
use crate::agent::RpcAgent;
use crate::error::FutureError;
use crate::error::RpcError;
use crate::future::ResultFuture;
use crate::rref::UserRRef;
use crate::rref_context::RRefContext;

/// The type of the single value returned by functions of `schema`.
pub fn single_return_type(schema: &FunctionSchema) -> Result<ValueType, RpcError> {
    match schema.returns() {
        [ret] => Ok(ret.ty.clone()),
        returns => Err(RpcError::InvalidSchema(format!(
            "{} must return exactly one value, but returns {}",
            schema.name(),
            returns.len()
        ))),
    }
}

/// Check `stack` against the arguments declared by `schema`. Schemas that
/// declare no arguments accept any stack.
pub fn check_arguments(schema: &FunctionSchema, stack: &[WireValue]) -> Result<(), RpcError> {
    let arguments = schema.arguments();
    if arguments.is_empty() {
        return Ok(());
    }
    if arguments.len() != stack.len() {
        return Err(RpcError::InvalidSchema(format!(
            "{} takes {} arguments, but {} were given",
            schema.name(),
            arguments.len(),
            stack.len()
        )));
    }
    for (argument, value) in arguments.iter().zip(stack) {
        if !argument.ty.admits(value) {
            return Err(RpcError::InvalidSchema(format!(
                "argument {} of {} expects {}, got {}",
                argument.name,
                schema.name(),
                argument.ty,
                value.value_type()
            )));
        }
    }
    Ok(())
}

/// Turn the raw response to a script call into the call's value.
fn decode_response(
    result: Result<&Message, &FutureError>,
    return_type: &ValueType,
) -> Result<WireValue, FutureError> {
    let message = result.map_err(Clone::clone)?;
    if let Some(what) = message.exception_text() {
        return Err(FutureError::new(what));
    }
    let value = ScriptResp::from_message(message)
        .map_err(|err| FutureError::from(RpcError::from(err)))?
        .into_value();
    if !return_type.admits(&value) {
        return Err(FutureError::new(format!(
            "expected a return value of type {}, got {}",
            return_type,
            value.value_type()
        )));
    }
    Ok(value)
}

/// Dispatches script calls from one worker.
#[derive(Clone)]
pub struct Dispatcher {
    agent: Arc<dyn RpcAgent>,
    ctx: Arc<RRefContext>,
    recorder: Arc<dyn GradientRecorder>,
}

impl Dispatcher {
    pub fn new(agent: Arc<dyn RpcAgent>, ctx: Arc<RRefContext>) -> Self {
        Self::with_recorder(agent, ctx, Arc::new(NoGradRecorder))
    }

    pub fn with_recorder(
        agent: Arc<dyn RpcAgent>,
        ctx: Arc<RRefContext>,
        recorder: Arc<dyn GradientRecorder>,
    ) -> Self {
        Self {
            agent,
            ctx,
            recorder,
        }
    }

    pub fn agent(&self) -> &Arc<dyn RpcAgent> {
        &self.agent
    }

    pub fn ctx(&self) -> &Arc<RRefContext> {
        &self.ctx
    }

    /// Call `qualified_name` on worker `dst_worker_name`. The returned
    /// future settles with the function's value, or with the error that
    /// prevented it. Nothing is sent if this returns an error.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(dst = %dst_worker_name, function = %qualified_name)
    )]
    pub fn dispatch_call(
        &self,
        dst_worker_name: &str,
        qualified_name: &QualifiedName,
        schema: &FunctionSchema,
        stack: Vec<WireValue>,
    ) -> Result<ResultFuture<WireValue>, RpcError> {
        let return_type = single_return_type(schema)?;
        check_arguments(schema, &stack)?;
        let dst = self.agent.get_worker_info(dst_worker_name)?;

        let message = ScriptCall::new(qualified_name.clone(), stack).into_message()?;
        let response = send_message_with_autograd(
            self.agent.as_ref(),
            &dst,
            message,
            false,
            self.recorder.as_ref(),
        )?;

        let future = ResultFuture::with_type(return_type.clone());
        let result = future.clone();
        response.add_callback(move |response| {
            let settled = match decode_response(response, &return_type) {
                Ok(value) => result.mark_completed(value),
                Err(err) => result.set_error(err),
            };
            if let Err(err) = settled {
                tracing::error!("failed to settle script call result: {}", err);
            }
        });
        tracing::debug!("sent script call to {}", dst);
        Ok(future)
    }

    /// Call `qualified_name` on worker `dst_worker_name`, which keeps the
    /// value and becomes the owner of the returned reference. The reference
    /// is pending until the owner acknowledges it.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(dst = %dst_worker_name, function = %qualified_name)
    )]
    pub fn dispatch_remote_call(
        &self,
        dst_worker_name: &str,
        qualified_name: &QualifiedName,
        schema: &FunctionSchema,
        stack: Vec<WireValue>,
    ) -> Result<Arc<UserRRef>, RpcError> {
        let dst = self.agent.get_worker_info(dst_worker_name)?;
        internal_assert!(
            dst.id != self.ctx.worker_id(),
            "remote call of {} targets the calling worker {}",
            qualified_name,
            dst
        );
        let return_type = single_return_type(schema)?;
        check_arguments(schema, &stack)?;

        let rref = self.ctx.create_user_rref(dst.id, return_type)?;
        let fork_id = rref.fork_id();
        let message =
            ScriptRemoteCall::new(qualified_name.clone(), stack, rref.rref_id(), fork_id)
                .into_message()?;

        // The acknowledgment may arrive before `send` returns, so the
        // reference must already be pending.
        self.ctx.add_pending_user(fork_id, Arc::clone(&rref))?;
        let response = match send_message_with_autograd(
            self.agent.as_ref(),
            &dst,
            message,
            false,
            self.recorder.as_ref(),
        ) {
            Ok(response) => response,
            Err(err) => {
                if let Err(rollback) = self.ctx.fail_pending_user(fork_id, FutureError::from(&err)) {
                    tracing::error!("failed to roll back {}: {}", rref, rollback);
                }
                return Err(err);
            }
        };

        let ctx = Arc::clone(&self.ctx);
        response.add_callback(move |response| match ctx.confirm_pending_user(response) {
            Ok(()) => {}
            // Already logged where it was raised.
            Err(RpcError::Internal(_)) => {}
            Err(err) => {
                if let Err(err) = ctx.fail_pending_user(fork_id, FutureError::from(&err)) {
                    tracing::error!("failed to fail pending user {}: {}", fork_id, err);
                }
            }
        });
        tracing::debug!("sent remote call to {}, created {}", dst, rref);
        Ok(rref)
    }
}
