// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic fractional sampling.
//!
//! An item is tracked when the FNV hash of its identity is a multiple of the
//! sampling factor. The decision depends only on the identity, so every phase
//! call for the same item agrees.

use crate::key::Identity;
use fnv::FnvHasher;
use std::hash::{Hash, Hasher};

/// Keeps roughly one item in `every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    every: u64,
}

impl Sampler {
    /// A sampler keeping one item in `every`. Zero and one keep everything.
    #[must_use]
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }

    #[must_use]
    pub fn every(&self) -> u64 {
        self.every
    }

    #[must_use]
    pub fn samples(&self, item: Identity) -> bool {
        if self.every == 1 {
            return true;
        }
        let mut hasher = FnvHasher::default();
        item.hash(&mut hasher);
        hasher.finish() % self.every == 0
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(1)
    }
}
