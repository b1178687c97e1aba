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

use async_trait::async_trait;
use tracing::instrument;

use super::{CaManagers, Error, Identity};
use crate::mesh::{Dataplane, Mesh};
use crate::tls::{CaBundle, IdentityCertificate};

/// CaProvider returns the CA bundle of the backend currently enabled on a mesh.
#[async_trait]
pub trait CaProvider: Send + Sync {
    async fn get(&self, mesh: &Mesh) -> Result<CaBundle, Error>;
}

/// IdentityProvider issues a new identity certificate for a dataplane.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get(&self, dataplane: &Dataplane, mesh: &Mesh) -> Result<IdentityCertificate, Error>;
}

/// Resolves the enabled backend through a [`CaManagers`] registry.
#[derive(Clone)]
pub struct BackendCaProvider {
    managers: CaManagers,
}

impl BackendCaProvider {
    pub fn new(managers: CaManagers) -> Self {
        Self { managers }
    }
}

#[async_trait]
impl CaProvider for BackendCaProvider {
    #[instrument(skip_all, fields(mesh=%mesh.name))]
    async fn get(&self, mesh: &Mesh) -> Result<CaBundle, Error> {
        let (backend, manager) = self.managers.resolve(mesh)?;
        let bundle = manager.root_certs(&mesh.name, backend).await?;
        if bundle.is_empty() {
            return Err(Error::EmptyBundle {
                mesh: mesh.name.clone(),
                backend: backend.name.clone(),
            });
        }
        Ok(bundle)
    }
}

/// Issues certificates through the enabled backend and checks the result carries the
/// dataplane's identities.
#[derive(Clone)]
pub struct BackendIdentityProvider {
    managers: CaManagers,
}

impl BackendIdentityProvider {
    pub fn new(managers: CaManagers) -> Self {
        Self { managers }
    }
}

#[async_trait]
impl IdentityProvider for BackendIdentityProvider {
    #[instrument(skip_all, fields(dataplane=%dataplane.key()))]
    async fn get(&self, dataplane: &Dataplane, mesh: &Mesh) -> Result<IdentityCertificate, Error> {
        if dataplane.mesh != mesh.name {
            return Err(Error::MeshMismatch {
                dataplane: dataplane.key(),
                mesh: mesh.name.clone(),
            });
        }
        let (backend, manager) = self.managers.resolve(mesh)?;
        let ttl = backend.rotation()?;
        let services = dataplane.services();
        if services.is_empty() {
            return Err(Error::NoServiceTag(dataplane.key()));
        }

        let certs = manager
            .generate_dataplane_cert(&mesh.name, backend, &services, ttl)
            .await?;

        let expected: Vec<Identity> = services
            .iter()
            .map(|s| Identity::service(&mesh.name, s))
            .collect();
        if let Some(missing) = certs.missing_san(&expected)? {
            return Err(Error::SanMismatch {
                backend: backend.name.clone(),
                expected: missing,
            });
        }
        Ok(certs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::{BuiltinCaManager, ErrorKind, builtin};
    use crate::store::MemoryStore;
    use crate::test_helpers::{self, DataplaneBuilder, MeshBuilder};
    use crate::time::MockClock;

    async fn managers() -> CaManagers {
        let builtin = BuiltinCaManager::new(Arc::new(MemoryStore::new()), Arc::new(MockClock::default()));
        let managers = CaManagers::new().with(builtin::BUILTIN_TYPE, Arc::new(builtin));
        managers
            .ensure_backends(&test_helpers::mesh_default())
            .await
            .unwrap();
        managers
    }

    #[tokio::test]
    async fn issues_identity_and_bundle() {
        let managers = managers().await;
        let mesh = test_helpers::mesh_default();
        let dp = test_helpers::dataplane_backend();

        let bundle = BackendCaProvider::new(managers.clone()).get(&mesh).await.unwrap();
        assert!(!bundle.is_empty());

        let certs = BackendIdentityProvider::new(managers)
            .get(&dp, &mesh)
            .await
            .unwrap();
        let leaf = certs.leaf().unwrap();
        assert_eq!(
            leaf.identities().unwrap(),
            vec![Identity::service("default", "backend")]
        );
        let root = &bundle.certificates().unwrap()[0];
        assert_eq!(leaf.issuer().unwrap(), root.subject().unwrap());
    }

    #[tokio::test]
    async fn rejects_misconfiguration() {
        let managers = managers().await;
        let identities = BackendIdentityProvider::new(managers.clone());
        let cas = BackendCaProvider::new(managers);
        let mesh = test_helpers::mesh_default();

        let other_mesh = DataplaneBuilder::new()
            .with_mesh("other")
            .with_services(&["backend"])
            .build();
        let err = identities.get(&other_mesh, &mesh).await.unwrap_err();
        assert!(matches!(err, Error::MeshMismatch { .. }));

        let untagged = DataplaneBuilder::new().with_tags([("version", "v1")]).build();
        let err = identities.get(&untagged, &mesh).await.unwrap_err();
        assert!(matches!(err, Error::NoServiceTag(_)));
        assert_eq!(err.kind(), ErrorKind::Config);

        let bad_rotation = MeshBuilder::new("default")
            .with_builtin_backend("ca-1", Some("forever"))
            .with_enabled_backend("ca-1")
            .build();
        let err = identities
            .get(&test_helpers::dataplane_backend(), &bad_rotation)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let unprovisioned = MeshBuilder::new("default")
            .with_builtin_backend("ca-3", Some("1h"))
            .with_enabled_backend("ca-3")
            .build();
        let err = cas.get(&unprovisioned).await.unwrap_err();
        assert!(matches!(err, Error::NotProvisioned { .. }));
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }
}
