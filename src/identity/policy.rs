// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decides whether cached certificates can be reused.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use crate::mesh::MultiValueTagSet;

/// Certificates are regenerated once this share of their lifetime has elapsed.
const ROTATION_NUMERATOR: u32 = 4;
const ROTATION_DENOMINATOR: u32 = 5;

/// Fingerprint is a digest of everything that affects issuance: the enabled backend and the
/// dataplane's tags. Equal fingerprints mean the cached certificate is still semantically valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn new(enabled_backend: &str, tags: &MultiValueTagSet) -> Self {
        // Fixed keys; equal inputs always produce equal digests within the process.
        let mut hasher = DefaultHasher::new();
        enabled_backend.hash(&mut hasher);
        tags.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Time after `generation` at which a certificate valid until `expiration` must be rotated.
pub fn rotation_threshold(generation: SystemTime, expiration: SystemTime) -> Duration {
    let ttl = expiration.duration_since(generation).unwrap_or_default();
    ttl * ROTATION_NUMERATOR / ROTATION_DENOMINATOR
}

/// Returns true once 4/5 of the lifetime has elapsed. A clock that moved backwards counts as no
/// time elapsed.
pub fn rotation_due(generation: SystemTime, expiration: SystemTime, now: SystemTime) -> bool {
    let elapsed = now.duration_since(generation).unwrap_or_default();
    elapsed >= rotation_threshold(generation, expiration)
}

/// Why a certificate has to be (re)generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    Missing,
    FingerprintChanged,
    RotationDue,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reason::Missing => "missing",
            Reason::FingerprintChanged => "fingerprint changed",
            Reason::RotationDue => "rotation due",
        })
    }
}

/// Cached state the policy looks at.
#[derive(Clone, Copy, Debug)]
pub struct Cached {
    pub fingerprint: Fingerprint,
    pub generation: SystemTime,
    pub expiration: SystemTime,
}

/// Returns why `cached` cannot be reused, or None if it can.
pub fn evaluate(cached: Option<Cached>, fingerprint: Fingerprint, now: SystemTime) -> Option<Reason> {
    let Some(cached) = cached else {
        return Some(Reason::Missing);
    };
    if cached.fingerprint != fingerprint {
        return Some(Reason::FingerprintChanged);
    }
    if rotation_due(cached.generation, cached.expiration, now) {
        return Some(Reason::RotationDue);
    }
    None
}
