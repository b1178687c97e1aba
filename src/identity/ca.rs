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
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Error;
use crate::mesh::{CertificateAuthorityBackend, Mesh};
use crate::strng::{self, Strng};
use crate::tls::{CaBundle, IdentityCertificate};

/// CaManager is implemented by every CA backend type.
#[async_trait]
pub trait CaManager: Send + Sync {
    /// Provisions trust material for the backend of `mesh`. Must be idempotent.
    async fn ensure(&self, mesh: &str, backend: &CertificateAuthorityBackend) -> Result<(), Error>;

    /// Returns the current root (and intermediate) certificates of the backend.
    async fn root_certs(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
    ) -> Result<CaBundle, Error>;

    /// Issues a fresh key and leaf certificate valid for `ttl`, carrying one SPIFFE identity per
    /// service.
    async fn generate_dataplane_cert(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
        services: &[Strng],
        ttl: Duration,
    ) -> Result<IdentityCertificate, Error>;
}

/// CaManagers maps a backend type to its implementation. It is built once at startup and handed
/// to whatever needs to resolve backends.
#[derive(Clone, Default)]
pub struct CaManagers {
    managers: HashMap<Strng, Arc<dyn CaManager>>,
}

impl CaManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend_type: impl AsRef<str>, manager: Arc<dyn CaManager>) -> Self {
        self.register(backend_type, manager);
        self
    }

    pub fn register(&mut self, backend_type: impl AsRef<str>, manager: Arc<dyn CaManager>) {
        self.managers.insert(strng::new(backend_type), manager);
    }

    pub fn get(&self, backend_type: &str) -> Result<&Arc<dyn CaManager>, Error> {
        self.managers
            .get(backend_type)
            .ok_or_else(|| Error::UnknownBackendType(strng::new(backend_type)))
    }

    /// Resolves the enabled backend of `mesh` together with the manager for its type.
    pub fn resolve<'a>(
        &'a self,
        mesh: &'a Mesh,
    ) -> Result<(&'a CertificateAuthorityBackend, &'a Arc<dyn CaManager>), Error> {
        let backend = mesh.enabled_backend()?;
        Ok((backend, self.get(&backend.backend_type)?))
    }

    /// Provisions every backend declared on `mesh`, not only the enabled one, so switching the
    /// enabled backend does not wait on provisioning.
    pub async fn ensure_backends(&self, mesh: &Mesh) -> Result<(), Error> {
        for backend in mesh.backends() {
            debug!(mesh=%mesh.name, backend=%backend.name, "ensuring CA backend");
            self.get(&backend.backend_type)?
                .ensure(&mesh.name, backend)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{BuiltinCaManager, ErrorKind, builtin};
    use crate::store::MemoryStore;
    use crate::test_helpers::MeshBuilder;
    use crate::time::SystemClock;

    fn managers() -> CaManagers {
        let builtin = BuiltinCaManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        CaManagers::new().with(builtin::BUILTIN_TYPE, Arc::new(builtin))
    }

    #[tokio::test]
    async fn unknown_type_is_a_resolution_error() {
        let mesh = MeshBuilder::new("default")
            .with_backend("vault-1", "vault", None)
            .with_enabled_backend("vault-1")
            .build();
        let managers = managers();
        let err = managers.resolve(&mesh).err().unwrap();
        assert!(matches!(err, Error::UnknownBackendType(ref t) if t == "vault"));
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(managers.ensure_backends(&mesh).await.is_err());
    }

    #[tokio::test]
    async fn ensure_provisions_all_backends() {
        let mesh = MeshBuilder::new("default")
            .with_builtin_backend("ca-1", Some("1h"))
            .with_builtin_backend("ca-2", Some("1h"))
            .with_enabled_backend("ca-1")
            .build();
        let managers = managers();
        managers.ensure_backends(&mesh).await.unwrap();
        let manager = managers.get(builtin::BUILTIN_TYPE).unwrap();
        for backend in mesh.backends() {
            let bundle = manager.root_certs(&mesh.name, backend).await.unwrap();
            assert!(!bundle.is_empty());
        }
        let (backend, _) = managers.resolve(&mesh).unwrap();
        assert_eq!(backend.name, "ca-1");
    }
}
