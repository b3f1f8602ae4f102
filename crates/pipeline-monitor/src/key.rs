// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Identity tokens and correlation keys.
//!
//! Work items do not have to implement value equality, and two components may
//! process the same item concurrently. Keys are therefore built from explicit
//! identity tokens: one for the owning component instance and one for the item.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Stable identity token of a component instance or work item.
///
/// Two values compare equal only if they were issued for the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl Identity {
    /// Issues a fresh identity from a process-wide sequence.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an identity the caller already owns, e.g. a source message id.
    #[must_use]
    pub const fn from_raw(token: u64) -> Self {
        Self(token)
    }

    /// Identity of the allocation behind an `Arc`.
    ///
    /// Only stable while at least one clone of the `Arc` is alive.
    #[must_use]
    pub fn of<T: ?Sized>(value: &Arc<T>) -> Self {
        Self(Arc::as_ptr(value).cast::<()>() as usize as u64)
    }

    #[must_use]
    pub const fn token(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Composite key matching a phase start with its eventual close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    owner: Identity,
    item: Identity,
}

impl CorrelationKey {
    #[must_use]
    pub const fn new(owner: Identity, item: Identity) -> Self {
        Self { owner, item }
    }

    #[must_use]
    pub const fn owner(&self) -> Identity {
        self.owner
    }

    #[must_use]
    pub const fn item(&self) -> Identity {
        self.item
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.item)
    }
}
