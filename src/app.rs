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

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{self, ConfigSource, LocalConfig};
use crate::identity::{
    self, BackendCaProvider, BackendIdentityProvider, BuiltinCaManager, CaManagers, SecretManager,
};
use crate::mesh::ResourceKey;
use crate::store::MemoryStore;
use crate::time::SystemClock;
use crate::{metrics, signal};

pub async fn build(config: config::Config) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let identity_metrics = Arc::new(identity::Metrics::new(&mut registry));

    let clock = Arc::new(SystemClock);
    let builtin = BuiltinCaManager::new(Arc::new(MemoryStore::new()), clock.clone());
    let managers =
        CaManagers::new().with(identity::builtin::BUILTIN_TYPE, Arc::new(builtin));
    let secrets = SecretManager::new(
        Arc::new(BackendCaProvider::new(managers.clone())),
        Arc::new(BackendIdentityProvider::new(managers.clone())),
        identity_metrics,
        clock,
    );

    let shutdown = signal::Shutdown::new();
    let mut tasks = Vec::new();

    let stats_server =
        metrics::server::Server::bind(config.stats_addr, Arc::new(registry), secrets.clone())
            .await
            .context("stats server starts")?;
    let stats_address = stats_server.address();
    tasks.push(stats_server.spawn(shutdown.token()));

    match config.local_config {
        Some(source) => {
            // Fail fast on a broken file; later cycles only log.
            LocalConfig::load(&source)
                .await
                .context("load local config")?;
            let reconciler = Reconciler::new(source, secrets, managers);
            tasks.push(reconciler.spawn(config.reconcile_interval, shutdown.token()));
        }
        None => warn!("no local config set, only serving metrics"),
    }

    Ok(Bound {
        stats_address,
        shutdown,
        termination_grace_period: config.termination_grace_period,
        tasks,
    })
}

pub struct Bound {
    pub stats_address: SocketAddr,

    pub shutdown: signal::Shutdown,
    termination_grace_period: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from an explicit trigger or signal
        self.shutdown.wait().await;

        match time::timeout(
            self.termination_grace_period,
            futures::future::join_all(self.tasks),
        )
        .await
        {
            Ok(_) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                self.termination_grace_period
            ),
        }
        Ok(())
    }
}

/// Outcome of a single reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub synced: usize,
    pub failed: usize,
    pub cleaned: usize,
}

/// Reconciler periodically reads the local config and keeps a certificate cached for every
/// dataplane of an mTLS enabled mesh.
pub struct Reconciler {
    source: ConfigSource,
    secrets: SecretManager,
    managers: CaManagers,
    known: HashSet<ResourceKey>,
}

impl Reconciler {
    pub fn new(source: ConfigSource, secrets: SecretManager, managers: CaManagers) -> Self {
        Self {
            source,
            secrets,
            managers,
            known: HashSet::new(),
        }
    }

    pub fn spawn(mut self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut ticker = time::interval(interval);
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match self.reconcile().await {
                        Ok(summary) => debug!(?summary, "reconciled"),
                        Err(e) => warn!("reconciliation failed: {e:#}"),
                    }
                }
                info!("reconciler terminated");
            }
            .instrument(info_span!("reconciler")),
        )
    }

    pub async fn reconcile(&mut self) -> anyhow::Result<ReconcileSummary> {
        let cfg = LocalConfig::load(&self.source).await?;
        for mesh in &cfg.meshes {
            if mesh.mtls.is_none() {
                continue;
            }
            if let Err(e) = self.managers.ensure_backends(mesh).await {
                warn!(mesh=%mesh.name, "failed to provision CA backends: {e}");
            }
        }

        let mut summary = ReconcileSummary::default();
        let mut seen = HashSet::new();
        for dp in &cfg.dataplanes {
            let Some(mesh) = cfg.mesh(&dp.mesh).filter(|m| m.mtls.is_some()) else {
                debug!(dataplane=%dp.key(), "mesh is unknown or has mTLS disabled");
                if self.evict(&dp.key()).await {
                    summary.cleaned += 1;
                }
                continue;
            };
            seen.insert(dp.key());
            match self.secrets.get(dp, mesh).await {
                Ok(_) => summary.synced += 1,
                // Already logged; the cached certificate, if any, stays in place.
                Err(_) => summary.failed += 1,
            }
        }

        for key in self.known.difference(&seen) {
            if self.evict(key).await {
                summary.cleaned += 1;
            }
        }
        self.known = seen;
        Ok(summary)
    }

    /// Cleans up `key`, returning whether a certificate was cached for it.
    async fn evict(&self, key: &ResourceKey) -> bool {
        let cached = self.secrets.info(key).is_some();
        self.secrets.cleanup(key).await;
        cached
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::test_helpers::Fixture;

    const CONFIG: &str = r#"
meshes:
- name: default
  mtls:
    enabledBackend: ca-1
    backends:
    - name: ca-1
      type: builtin
      dpCert:
        rotation:
          expiration: 1h
    - name: ca-2
      type: builtin
- name: plain
dataplanes:
- mesh: default
  name: backend-1
  inbound:
  - port: 8080
    tags:
      kuma.io/service: backend
- mesh: default
  name: untagged
  inbound:
  - port: 8080
    tags:
      version: v1
- mesh: plain
  name: web-1
  inbound:
  - port: 8080
    tags:
      kuma.io/service: web
- mesh: gone
  name: orphan
"#;

    #[tokio::test]
    async fn reconcile_tracks_config() {
        let f = Fixture::new().await;
        let mut reconciler = Reconciler::new(
            ConfigSource::Static(Bytes::from_static(CONFIG.as_bytes())),
            f.secrets.clone(),
            f.managers.clone(),
        );
        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                synced: 1,
                failed: 1,
                cleaned: 0,
            }
        );
        let backend = ResourceKey::new("default", "backend-1");
        assert_eq!(f.secrets.info(&backend).unwrap().enabled_backend, "ca-1");
        assert!(f.secrets.info(&ResourceKey::new("plain", "web-1")).is_none());

        // nothing changed, nothing regenerated
        reconciler.reconcile().await.unwrap();
        assert_eq!(f.metrics.cert_generation.get(), 1);

        // a removed dataplane is cleaned up
        reconciler.source = ConfigSource::Static(Bytes::from_static(
            b"meshes:\n- name: default\n  mtls:\n    enabledBackend: ca-1\n",
        ));
        let summary = reconciler.reconcile().await.unwrap();
        // untagged never had a certificate
        assert_eq!(
            summary,
            ReconcileSummary {
                synced: 0,
                failed: 0,
                cleaned: 1,
            }
        );
        assert!(f.secrets.info(&backend).is_none());
        assert!(f.secrets.dump().is_empty());
    }

    #[tokio::test]
    async fn bound_terminates_on_trigger() {
        crate::test_helpers::initialize_telemetry();
        let bound = build(config::Config {
            stats_addr: "127.0.0.1:0".parse().unwrap(),
            local_config: None,
            reconcile_interval: Duration::from_secs(10),
            termination_grace_period: Duration::from_secs(1),
        })
        .await
        .unwrap();
        assert_ne!(bound.stats_address.port(), 0);
        bound.shutdown.trigger();
        time::timeout(Duration::from_secs(5), bound.wait_termination())
            .await
            .unwrap()
            .unwrap();
    }
}
