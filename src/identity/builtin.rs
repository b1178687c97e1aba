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

//! A CA backend that signs with its own self-signed root. The root key and certificate are
//! generated on first use and persisted through the secret store, one pair per mesh and backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{debug, info, instrument};

use super::{CaManager, Error, Identity};
use crate::mesh::{CertificateAuthorityBackend, ResourceKey};
use crate::store::{self, Secret, SecretStore};
use crate::strng::Strng;
use crate::time::Clock;
use crate::tls::{CaBundle, IdentityCertificate};

pub const BUILTIN_TYPE: &str = "builtin";

const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
// Leaf certificates start this far in the past so peers with a slightly late clock accept them.
const ALLOWED_CLOCK_SKEW: Duration = Duration::from_secs(10);

struct RootCa {
    cert: Certificate,
    key: KeyPair,
}

pub struct BuiltinCaManager {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    roots: RwLock<HashMap<ResourceKey, Arc<RootCa>>>,
}

impl fmt::Debug for BuiltinCaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinCaManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn cert_key(mesh: &str, backend: &str) -> ResourceKey {
    ResourceKey::new(mesh, format!("{mesh}.ca-builtin-cert-{backend}"))
}

fn key_key(mesh: &str, backend: &str) -> ResourceKey {
    ResourceKey::new(mesh, format!("{mesh}.ca-builtin-key-{backend}"))
}

impl BuiltinCaManager {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            roots: Default::default(),
        }
    }

    fn new_root(&self, mesh: &str, key: &KeyPair) -> Result<Certificate, Error> {
        let now = self.clock.now();
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, "meshcert");
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, "Mesh");
        params.distinguished_name.push(DnType::CommonName, mesh);
        params.subject_alt_names = vec![SanType::URI(format!("spiffe://{mesh}").try_into()?)];
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = (now - ALLOWED_CLOCK_SKEW).into();
        params.not_after = (now + ROOT_VALIDITY).into();

        Ok(params.self_signed(key)?)
    }

    /// Loads the root for the backend, from memory if this instance has seen it before.
    async fn root(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
    ) -> Result<Arc<RootCa>, Error> {
        let id = cert_key(mesh, &backend.name);
        if let Some(root) = self.roots.read().unwrap().get(&id) {
            return Ok(root.clone());
        }

        let not_provisioned = || Error::NotProvisioned {
            mesh: crate::strng::new(mesh),
            backend: backend.name.clone(),
        };
        let cert = self.store.get(&id).await?.ok_or_else(not_provisioned)?;
        let key = self
            .store
            .get(&key_key(mesh, &backend.name))
            .await?
            .ok_or_else(not_provisioned)?;

        let key = KeyPair::from_pem(&pem_str(&key.data)?)?;
        // rcgen cannot sign with a parsed certificate directly; re-create one with the same
        // subject and key. Only its name and key are used when issuing leaves.
        let cert = CertificateParams::from_ca_cert_pem(&pem_str(&cert.data)?)?.self_signed(&key)?;

        let root = Arc::new(RootCa { cert, key });
        self.roots
            .write()
            .unwrap()
            .entry(id)
            .or_insert_with(|| root.clone());
        Ok(root)
    }
}

fn pem_str(data: &Bytes) -> Result<String, Error> {
    String::from_utf8(data.to_vec())
        .map_err(|e| Error::Signing(crate::tls::Error::CertificateParseError(e.to_string())))
}

#[async_trait]
impl CaManager for BuiltinCaManager {
    #[instrument(skip_all, fields(%mesh, backend=%backend.name))]
    async fn ensure(&self, mesh: &str, backend: &CertificateAuthorityBackend) -> Result<(), Error> {
        let cert_id = cert_key(mesh, &backend.name);
        if self.store.get(&cert_id).await?.is_some() {
            debug!("root already provisioned");
            return Ok(());
        }

        // The key is written first and never removed, the cert marks completion. A stored key
        // without a cert is adopted, so an interrupted provisioning finishes on the next call.
        let key_id = key_key(mesh, &backend.name);
        let generated = KeyPair::generate()?;
        let key = match self
            .store
            .create(
                &key_id,
                Secret {
                    data: generated.serialize_pem().into(),
                },
            )
            .await
        {
            Ok(()) => generated,
            Err(store::Error::AlreadyExists(_)) => {
                debug!("adopting stored root key");
                let stored = self.store.get(&key_id).await?.ok_or_else(|| {
                    Error::NotProvisioned {
                        mesh: crate::strng::new(mesh),
                        backend: backend.name.clone(),
                    }
                })?;
                KeyPair::from_pem(&pem_str(&stored.data)?)?
            }
            Err(e) => return Err(e.into()),
        };

        let cert = self.new_root(mesh, &key)?;
        match self
            .store
            .create(
                &cert_id,
                Secret {
                    data: cert.pem().into(),
                },
            )
            .await
        {
            Ok(()) => {}
            Err(store::Error::AlreadyExists(_)) => {
                // Signed with the same stored key; loaded from the store on first use.
                debug!("root provisioned concurrently");
                return Ok(());
            }
            // The key stays in place for the next attempt to adopt.
            Err(e) => return Err(e.into()),
        }

        info!("provisioned builtin CA root");
        self.roots
            .write()
            .unwrap()
            .insert(cert_id, Arc::new(RootCa { cert, key }));
        Ok(())
    }

    async fn root_certs(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
    ) -> Result<CaBundle, Error> {
        let cert = self
            .store
            .get(&cert_key(mesh, &backend.name))
            .await?
            .ok_or_else(|| Error::NotProvisioned {
                mesh: crate::strng::new(mesh),
                backend: backend.name.clone(),
            })?;
        Ok(CaBundle {
            pem_certs: vec![cert.data],
        })
    }

    #[instrument(skip_all, fields(%mesh, backend=%backend.name))]
    async fn generate_dataplane_cert(
        &self,
        mesh: &str,
        backend: &CertificateAuthorityBackend,
        services: &[Strng],
        ttl: Duration,
    ) -> Result<IdentityCertificate, Error> {
        let root = self.root(mesh, backend).await?;
        let now = self.clock.now();

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = services
            .iter()
            .map(|s| Ok(SanType::URI(Identity::service(mesh, s).to_string().try_into()?)))
            .collect::<Result<Vec<_>, rcgen::Error>>()?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.not_before = (now - ALLOWED_CLOCK_SKEW).into();
        params.not_after = (now + ttl).into();

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &root.cert, &root.key)?;
        debug!(services=?services, ?ttl, "issued dataplane certificate");
        Ok(IdentityCertificate {
            pem_certs: cert.pem().into(),
            pem_key: key.serialize_pem().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::identity::ErrorKind;
    use crate::store::MemoryStore;
    use crate::strng;
    use crate::time::MockClock;
    use crate::tls::parse_cert;

    fn backend(name: &str) -> CertificateAuthorityBackend {
        CertificateAuthorityBackend {
            name: strng::new(name),
            backend_type: strng::new(BUILTIN_TYPE),
            dp_cert: None,
        }
    }

    #[tokio::test]
    async fn root_is_provisioned_once() {
        let store = Arc::new(MemoryStore::new());
        let ca = BuiltinCaManager::new(store.clone(), Arc::new(MockClock::default()));
        let ca1 = backend("ca-1");

        let err = ca.root_certs("default", &ca1).await.unwrap_err();
        assert!(matches!(err, Error::NotProvisioned { .. }));
        assert_eq!(err.kind(), ErrorKind::Resolution);

        ca.ensure("default", &ca1).await.unwrap();
        let first = ca.root_certs("default", &ca1).await.unwrap();
        ca.ensure("default", &ca1).await.unwrap();
        assert_eq!(ca.root_certs("default", &ca1).await.unwrap(), first);

        let root = parse_cert(&first.pem_certs[0]).unwrap();
        assert!(root.is_ca().unwrap());
        assert!(root.subject().unwrap().contains("CN=default"));

        // a second manager sharing the store sees the same root
        let other = BuiltinCaManager::new(store, Arc::new(MockClock::default()));
        assert_eq!(other.root_certs("default", &ca1).await.unwrap(), first);
    }

    #[tokio::test]
    async fn orphaned_key_is_adopted() {
        // a provisioning that stopped after the key write
        let store = Arc::new(MemoryStore::new());
        let orphan = KeyPair::generate().unwrap();
        store
            .create(
                &key_key("default", "ca-1"),
                Secret {
                    data: orphan.serialize_pem().into(),
                },
            )
            .await
            .unwrap();

        let ca = BuiltinCaManager::new(store.clone(), Arc::new(MockClock::default()));
        let ca1 = backend("ca-1");
        ca.ensure("default", &ca1).await.unwrap();
        let bundle = ca.root_certs("default", &ca1).await.unwrap();
        ca.ensure("default", &ca1).await.unwrap();
        assert_eq!(ca.root_certs("default", &ca1).await.unwrap(), bundle);

        // the root is issued for the stored key
        let (_, pem) = x509_parser::pem::parse_x509_pem(&bundle.pem_certs[0]).unwrap();
        let root = pem.parse_x509().unwrap();
        assert_eq!(
            root.public_key().subject_public_key.data.as_ref(),
            orphan.public_key_raw()
        );

        let other = BuiltinCaManager::new(store, Arc::new(MockClock::default()));
        other
            .generate_dataplane_cert(
                "default",
                &ca1,
                &[strng::new("backend")],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backends_have_distinct_roots() {
        let ca = BuiltinCaManager::new(Arc::new(MemoryStore::new()), Arc::new(MockClock::default()));
        ca.ensure("default", &backend("ca-1")).await.unwrap();
        ca.ensure("default", &backend("ca-2")).await.unwrap();
        assert_ne!(
            ca.root_certs("default", &backend("ca-1")).await.unwrap(),
            ca.root_certs("default", &backend("ca-2")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn leaf_is_signed_by_root() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let store = Arc::new(MemoryStore::new());
        let ca1 = backend("ca-1");
        BuiltinCaManager::new(store.clone(), Arc::new(MockClock::new(now)))
            .ensure("default", &ca1)
            .await
            .unwrap();

        // a fresh manager has to load the root from the store
        let ca = BuiltinCaManager::new(store, Arc::new(MockClock::new(now)));
        let services = [strng::new("backend"), strng::new("web")];
        let leaf = ca
            .generate_dataplane_cert("default", &ca1, &services, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(leaf.has_private_key());

        let cert = leaf.leaf().unwrap();
        assert_eq!(
            cert.identities().unwrap(),
            vec![
                Identity::service("default", "backend"),
                Identity::service("default", "web"),
            ]
        );
        assert!(!cert.is_ca().unwrap());
        assert_eq!(cert.expiry.not_after, now + Duration::from_secs(3600));
        assert_eq!(cert.expiry.not_before, now - ALLOWED_CLOCK_SKEW);

        let root = parse_cert(&ca.root_certs("default", &ca1).await.unwrap().pem_certs[0]).unwrap();
        assert_eq!(cert.issuer().unwrap(), root.subject().unwrap());
    }

    #[tokio::test]
    async fn leaf_requires_provisioning() {
        let ca = BuiltinCaManager::new(Arc::new(MemoryStore::new()), Arc::new(MockClock::default()));
        let err = ca
            .generate_dataplane_cert(
                "default",
                &backend("ca-1"),
                &[strng::new("backend")],
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotProvisioned { .. }));
    }
}
