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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use super::metrics::{CertGenerated, GenerationFailed};
use super::policy::{self, Cached, Fingerprint, Reason};
use super::{CaProvider, Error, IdentityProvider, Metrics};
use crate::mesh::{Dataplane, Mesh, MultiValueTagSet, ResourceKey};
use crate::metrics::IncrementRecorder;
use crate::strng::Strng;
use crate::time::Clock;
use crate::tls::{CaBundle, IdentityCertificate};

/// CertInfo describes a cached certificate without exposing key material.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertInfo {
    #[serde(serialize_with = "serialize_time")]
    pub generation: SystemTime,
    #[serde(serialize_with = "serialize_time")]
    pub expiration: SystemTime,
    pub enabled_backend: Strng,
    pub tags: MultiValueTagSet,
}

fn serialize_time<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&chrono::DateTime::<chrono::Utc>::from(*t).to_rfc3339())
}

/// An immutable cache entry. Regeneration replaces the whole entry.
#[derive(Debug)]
struct CertEntry {
    identity: IdentityCertificate,
    ca: CaBundle,
    fingerprint: Fingerprint,
    info: CertInfo,
}

impl CertEntry {
    fn cached(&self) -> Cached {
        Cached {
            fingerprint: self.fingerprint,
            generation: self.info.generation,
            expiration: self.info.expiration,
        }
    }

    fn material(&self) -> (IdentityCertificate, CaBundle) {
        (self.identity.clone(), self.ca.clone())
    }
}

/// Per dataplane cache slot. `refresh` serializes regeneration and cleanup of the key; `current`
/// is only locked to swap or read the entry pointer.
#[derive(Debug, Default)]
struct Slot {
    current: RwLock<Option<Arc<CertEntry>>>,
    refresh: tokio::sync::Mutex<()>,
    // Set once the slot has been removed from the cache; holders must look the key up again.
    evicted: AtomicBool,
}

impl Slot {
    fn current(&self) -> Option<Arc<CertEntry>> {
        self.current.read().unwrap().clone()
    }
}

/// Returns the cached entry if it can be served as is, or why it cannot.
fn reusable(
    current: Option<Arc<CertEntry>>,
    fingerprint: Fingerprint,
    now: SystemTime,
) -> Result<Arc<CertEntry>, Reason> {
    let Some(entry) = current else {
        return Err(Reason::Missing);
    };
    match policy::evaluate(Some(entry.cached()), fingerprint, now) {
        None => Ok(entry),
        Some(reason) => Err(reason),
    }
}

/// SecretManager caches dataplane certificates and CA bundles, regenerating them only when the
/// enabled backend or the dataplane's tags change, when 4/5 of the certificate lifetime has
/// elapsed, or after a cleanup.
#[derive(Clone)]
pub struct SecretManager {
    ca_provider: Arc<dyn CaProvider>,
    identity_provider: Arc<dyn IdentityProvider>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    cache: Arc<RwLock<HashMap<ResourceKey, Arc<Slot>>>>,
}

impl SecretManager {
    pub fn new(
        ca_provider: Arc<dyn CaProvider>,
        identity_provider: Arc<dyn IdentityProvider>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ca_provider,
            identity_provider,
            metrics,
            clock,
            cache: Default::default(),
        }
    }

    fn slot(&self, key: &ResourceKey) -> Arc<Slot> {
        if let Some(slot) = self.cache.read().unwrap().get(key) {
            return slot.clone();
        }
        self.cache
            .write()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Returns the identity certificate and CA bundle for `dataplane`, generating them if the
    /// cached ones cannot be reused. On failure the cached entry, if any, is left in place.
    #[instrument(skip_all, fields(dataplane=%dataplane.key()))]
    pub async fn get(
        &self,
        dataplane: &Dataplane,
        mesh: &Mesh,
    ) -> Result<(IdentityCertificate, CaBundle), Error> {
        let key = dataplane.key();
        let enabled_backend = mesh.enabled_backend_name();
        let tags = dataplane.tag_set();
        let fingerprint = Fingerprint::new(&enabled_backend, &tags);

        loop {
            let slot = self.slot(&key);

            // Fast path, no need to wait for other callers.
            if let Ok(entry) = reusable(slot.current(), fingerprint, self.clock.now()) {
                return Ok(entry.material());
            }

            let _refresh = slot.refresh.lock().await;
            if slot.evicted.load(Ordering::Acquire) {
                debug!("cache entry was cleaned up while waiting, retrying");
                continue;
            }
            // Another caller may have regenerated while we waited.
            let now = self.clock.now();
            let reason = match reusable(slot.current(), fingerprint, now) {
                Ok(entry) => return Ok(entry.material()),
                Err(reason) => reason,
            };

            info!(%reason, backend=%enabled_backend, "generating certificate");
            let entry = match self
                .generate(dataplane, mesh, now, fingerprint, tags.clone())
                .await
            {
                Ok(entry) => Arc::new(entry),
                Err(e) => {
                    warn!(kind=?e.kind(), "failed to generate certificate: {e}");
                    self.metrics.increment(&GenerationFailed(e.kind()));
                    if slot.current().is_none() {
                        self.evict(&key, &slot);
                    }
                    return Err(e);
                }
            };
            *slot.current.write().unwrap() = Some(entry.clone());
            self.metrics.increment(&CertGenerated);
            return Ok(entry.material());
        }
    }

    async fn generate(
        &self,
        dataplane: &Dataplane,
        mesh: &Mesh,
        now: SystemTime,
        fingerprint: Fingerprint,
        tags: MultiValueTagSet,
    ) -> Result<CertEntry, Error> {
        let backend = mesh.enabled_backend()?;
        let ttl = backend.rotation()?;
        let ca = self.ca_provider.get(mesh).await?;
        let identity = self.identity_provider.get(dataplane, mesh).await?;
        Ok(CertEntry {
            identity,
            ca,
            fingerprint,
            info: CertInfo {
                generation: now,
                expiration: now + ttl,
                enabled_backend: backend.name.clone(),
                tags,
            },
        })
    }

    /// Returns what is cached for `key`, or None if nothing is.
    pub fn info(&self, key: &ResourceKey) -> Option<CertInfo> {
        let slot = self.cache.read().unwrap().get(key).cloned()?;
        slot.current().map(|e| e.info.clone())
    }

    /// Drops the cached certificate for `key`. Waits for an in-flight generation for the key to
    /// finish; the next `get` generates a new certificate.
    pub async fn cleanup(&self, key: &ResourceKey) {
        let Some(slot) = self.cache.read().unwrap().get(key).cloned() else {
            return;
        };
        let _refresh = slot.refresh.lock().await;
        self.evict(key, &slot);
        debug!(%key, "cleaned up certificate");
    }

    /// Removes `slot` from the cache if it is still the one for `key`. Must hold its refresh lock.
    fn evict(&self, key: &ResourceKey, slot: &Arc<Slot>) {
        {
            let mut cache = self.cache.write().unwrap();
            if cache.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                cache.remove(key);
            }
        }
        slot.evicted.store(true, Ordering::Release);
        *slot.current.write().unwrap() = None;
    }

    /// Snapshot of every cached certificate, sorted by key.
    pub fn dump(&self) -> Vec<(ResourceKey, CertInfo)> {
        let slots: Vec<_> = self
            .cache
            .read()
            .unwrap()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let mut certs: Vec<_> = slots
            .into_iter()
            .filter_map(|(k, s)| s.current().map(|e| (k, e.info.clone())))
            .collect();
        certs.sort_by(|a, b| a.0.cmp(&b.0));
        certs
    }
}
