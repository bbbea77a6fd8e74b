/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identifiers for workers, remote references, and their forks.
//!
//! | Entity          | Identifier                      |
//! |-----------------|---------------------------------|
//! | Worker          | `name#id`                       |
//! | Globally unique | `GUID(created_on, local_id)`    |
//! | RRef            | `rref:GUID(created_on, local_id)` |
//! | Fork            | `fork:GUID(created_on, local_id)` |

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The numeric id of a worker in the RPC group.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct WorkerId(pub u16);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker's name together with its id. Names are unique within an RPC group.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    pub name: String,
    pub id: WorkerId,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, id: WorkerId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// An id that is unique across the whole group: the worker that minted it,
/// and a sequence number local to that worker.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct GloballyUniqueId {
    pub created_on: WorkerId,
    pub local_id: u64,
}

impl GloballyUniqueId {
    pub fn new(created_on: WorkerId, local_id: u64) -> Self {
        Self {
            created_on,
            local_id,
        }
    }
}

impl fmt::Display for GloballyUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GUID({}, {})", self.created_on, self.local_id)
    }
}

/// Identifies the value a remote reference points to.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct RRefId(pub GloballyUniqueId);

impl fmt::Display for RRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rref:{}", self.0)
    }
}

/// Identifies one user-held copy of a remote reference. Every copy gets
/// its own fork id, so confirmations can be matched to the copy they are for.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct ForkId(pub GloballyUniqueId);

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fork:{}", self.0)
    }
}
