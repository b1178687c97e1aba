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

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus_client::registry::Registry;
use rcgen::{CertificateParams, KeyPair, SanType};
use tracing::debug;

use crate::identity::{
    BackendCaProvider, BackendIdentityProvider, BuiltinCaManager, CaManager, CaManagers, Error,
    Metrics, SecretManager, builtin,
};
use crate::mesh::{
    CertificateAuthorityBackend, Dataplane, DpCert, Inbound, Mesh, Mtls, ResourceKey, Rotation,
    SERVICE_TAG,
};
use crate::store::MemoryStore;
use crate::strng::{self, Strng};
use crate::telemetry;
use crate::time::MockClock;
use crate::tls::{self, CaBundle, IdentityCertificate};

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

/// Builds dataplanes for tests. Defaults to `default/dp-1` without inbounds.
#[derive(Clone, Debug)]
pub struct DataplaneBuilder {
    dataplane: Dataplane,
}

impl Default for DataplaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DataplaneBuilder {
    pub fn new() -> Self {
        Self {
            dataplane: Dataplane {
                mesh: strng::literal!("default"),
                name: strng::literal!("dp-1"),
                address: None,
                inbound: Vec::new(),
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.dataplane.name = strng::new(name);
        self
    }

    pub fn with_mesh(mut self, mesh: &str) -> Self {
        self.dataplane.mesh = strng::new(mesh);
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.dataplane.address = Some(address);
        self
    }

    /// Replaces the inbounds with one inbound per service.
    pub fn with_services(mut self, services: &[&str]) -> Self {
        self.dataplane.inbound.clear();
        for service in services {
            self = self.with_tags([(SERVICE_TAG, *service)]);
        }
        self
    }

    /// Appends an inbound carrying `tags`.
    pub fn with_tags<'a>(mut self, tags: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let port = 8080 + self.dataplane.inbound.len() as u16;
        self.dataplane.inbound.push(Inbound {
            port,
            service_port: None,
            tags: tags
                .into_iter()
                .map(|(k, v)| (strng::new(k), strng::new(v)))
                .collect::<BTreeMap<_, _>>(),
        });
        self
    }

    pub fn key(&self) -> ResourceKey {
        self.dataplane.key()
    }

    pub fn build(self) -> Dataplane {
        self.dataplane
    }
}

pub fn dataplane_backend_builder() -> DataplaneBuilder {
    DataplaneBuilder::new()
        .with_name("backend")
        .with_address(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)))
        .with_services(&["backend"])
}

pub fn dataplane_backend() -> Dataplane {
    dataplane_backend_builder().build()
}

/// Builds meshes for tests. A mesh without backends has mTLS disabled.
#[derive(Clone, Debug)]
pub struct MeshBuilder {
    name: Strng,
    enabled_backend: Strng,
    backends: Vec<CertificateAuthorityBackend>,
}

impl MeshBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: strng::new(name),
            enabled_backend: strng::EMPTY,
            backends: Vec::new(),
        }
    }

    pub fn with_backend(mut self, name: &str, backend_type: &str, expiration: Option<&str>) -> Self {
        self.backends.push(CertificateAuthorityBackend {
            name: strng::new(name),
            backend_type: strng::new(backend_type),
            dp_cert: expiration.map(|e| DpCert {
                rotation: Some(Rotation {
                    expiration: e.to_string(),
                }),
            }),
        });
        self
    }

    pub fn with_builtin_backend(self, name: &str, expiration: Option<&str>) -> Self {
        self.with_backend(name, builtin::BUILTIN_TYPE, expiration)
    }

    pub fn with_enabled_backend(mut self, name: &str) -> Self {
        self.enabled_backend = strng::new(name);
        self
    }

    pub fn build(self) -> Mesh {
        let mtls = if self.backends.is_empty() && self.enabled_backend.is_empty() {
            None
        } else {
            Some(Mtls {
                enabled_backend: self.enabled_backend,
                backends: self.backends,
            })
        };
        Mesh {
            name: self.name,
            mtls,
        }
    }
}

/// `default` mesh with two builtin backends issuing 1h certificates, `ca-1` enabled.
pub fn mesh_default_builder() -> MeshBuilder {
    MeshBuilder::new("default")
        .with_builtin_backend("ca-1", Some("1h"))
        .with_builtin_backend("ca-2", Some("1h"))
        .with_enabled_backend("ca-1")
}

pub fn mesh_default() -> Mesh {
    mesh_default_builder().build()
}

/// Returns a self-signed certificate carrying the given URI SANs, and its key, as PEM.
pub fn self_signed(uris: &[&str]) -> (String, String) {
    let mut params = CertificateParams::default();
    params.subject_alt_names = uris
        .iter()
        .map(|u| SanType::URI((*u).try_into().unwrap()))
        .collect();
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// FakeCaManager wraps the builtin CA and can be told to slow down or fail signing.
#[derive(Debug)]
pub struct FakeCaManager {
    inner: BuiltinCaManager,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    signed: AtomicUsize,
}

impl FakeCaManager {
    pub fn new(inner: BuiltinCaManager) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of certificates signed successfully.
    pub fn signed(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaManager for FakeCaManager {
    async fn ensure(&self, mesh: &str, backend: &CertificateAuthorityBackend) -> Result<(), Error> {
        self.inner.ensure(mesh, backend).await
    }

    async fn root_certs(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
    ) -> Result<CaBundle, Error> {
        self.inner.root_certs(mesh, backend).await
    }

    async fn generate_dataplane_cert(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
        services: &[Strng],
        ttl: Duration,
    ) -> Result<IdentityCertificate, Error> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            debug!(%mesh, backend=%backend.name, "injecting signing failure");
            return Err(Error::Signing(tls::Error::CertificateParseError(
                "injected failure".to_string(),
            )));
        }
        let certs = self
            .inner
            .generate_dataplane_cert(mesh, backend, services, ttl)
            .await?;
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(certs)
    }
}

/// Everything needed to drive a SecretManager against the builtin CA with a controllable clock.
pub struct Fixture {
    pub secrets: SecretManager,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<Registry>,
    pub clock: MockClock,
    pub ca: Arc<FakeCaManager>,
    pub managers: CaManagers,
}

impl Fixture {
    /// Provisions the backends of [`mesh_default`].
    pub async fn new() -> Self {
        initialize_telemetry();
        let clock = MockClock::default();
        let builtin = BuiltinCaManager::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        let ca = Arc::new(FakeCaManager::new(builtin));
        let managers = CaManagers::new().with(builtin::BUILTIN_TYPE, ca.clone());
        managers.ensure_backends(&mesh_default()).await.unwrap();

        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::new(&mut registry));
        let secrets = SecretManager::new(
            Arc::new(BackendCaProvider::new(managers.clone())),
            Arc::new(BackendIdentityProvider::new(managers.clone())),
            metrics.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            secrets,
            metrics,
            registry: Arc::new(registry),
            clock,
            ca,
            managers,
        }
    }
}
