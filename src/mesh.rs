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

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use itertools::Itertools;

use crate::identity::Error;
use crate::strng::{self, Strng};

/// Tag carrying the service a dataplane inbound belongs to. Identities are derived from it.
pub const SERVICE_TAG: &str = "kuma.io/service";

/// Leaf certificate lifetime used when a backend does not configure one.
pub const DEFAULT_ROTATION_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// ResourceKey identifies a mesh scoped resource. For dataplanes it is also the secrets cache key.
#[derive(
    Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ResourceKey {
    pub mesh: Strng,
    pub name: Strng,
}

impl ResourceKey {
    pub fn new(mesh: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            mesh: strng::new(mesh),
            name: strng::new(name),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.mesh, self.name)
    }
}

/// MultiValueTagSet is the union of a dataplane's inbound tags. Keys are unique and each key maps
/// to an unordered set of values; both levels are kept sorted so equality and hashing do not
/// depend on the order the tags were declared in.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MultiValueTagSet(BTreeMap<Strng, BTreeSet<Strng>>);

impl MultiValueTagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) {
        self.0
            .entry(strng::new(key))
            .or_default()
            .insert(strng::new(value));
    }

    pub fn values(&self, key: &str) -> impl Iterator<Item = &Strng> {
        self.0.get(key).into_iter().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Strng> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for MultiValueTagSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = MultiValueTagSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

impl fmt::Display for MultiValueTagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            self.0
                .iter()
                .map(|(k, vs)| format!("{k}={}", vs.iter().join(",")))
                .join(" ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mesh {
    pub name: Strng,
    #[serde(default)]
    pub mtls: Option<Mtls>,
}

impl Mesh {
    /// Name of the enabled CA backend, empty when mTLS is not configured.
    pub fn enabled_backend_name(&self) -> Strng {
        self.mtls
            .as_ref()
            .map(|m| m.enabled_backend.clone())
            .unwrap_or(strng::EMPTY)
    }

    /// Resolves the enabled backend definition.
    pub fn enabled_backend(&self) -> Result<&CertificateAuthorityBackend, Error> {
        let mtls = self
            .mtls
            .as_ref()
            .filter(|m| !m.enabled_backend.is_empty())
            .ok_or_else(|| Error::MtlsDisabled(self.name.clone()))?;
        mtls.backends
            .iter()
            .find(|b| b.name == mtls.enabled_backend)
            .ok_or_else(|| Error::BackendNotFound {
                mesh: self.name.clone(),
                backend: mtls.enabled_backend.clone(),
            })
    }

    pub fn backends(&self) -> &[CertificateAuthorityBackend] {
        self.mtls
            .as_ref()
            .map(|m| m.backends.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mtls {
    #[serde(default)]
    pub enabled_backend: Strng,
    #[serde(default)]
    pub backends: Vec<CertificateAuthorityBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CertificateAuthorityBackend {
    pub name: Strng,
    #[serde(rename = "type")]
    pub backend_type: Strng,
    #[serde(default)]
    pub dp_cert: Option<DpCert>,
}

impl CertificateAuthorityBackend {
    /// Lifetime of the leaf certificates issued by this backend.
    pub fn rotation(&self) -> Result<Duration, Error> {
        let Some(expiration) = self
            .dp_cert
            .as_ref()
            .and_then(|c| c.rotation.as_ref())
            .map(|r| r.expiration.as_str())
        else {
            return Ok(DEFAULT_ROTATION_EXPIRATION);
        };
        let invalid = |reason: String| Error::InvalidRotation {
            backend: self.name.clone(),
            value: expiration.to_string(),
            reason,
        };
        let ttl = duration_str::parse(expiration).map_err(|e| invalid(e.to_string()))?;
        if ttl.is_zero() {
            return Err(invalid("expiration must be positive".to_string()));
        }
        Ok(ttl)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DpCert {
    #[serde(default)]
    pub rotation: Option<Rotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rotation {
    pub expiration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Dataplane {
    pub mesh: Strng,
    pub name: Strng,
    #[serde(default)]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub inbound: Vec<Inbound>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Inbound {
    pub port: u16,
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub tags: BTreeMap<Strng, Strng>,
}

impl Dataplane {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            mesh: self.mesh.clone(),
            name: self.name.clone(),
        }
    }

    /// Union of all inbound tags.
    pub fn tag_set(&self) -> MultiValueTagSet {
        self.inbound
            .iter()
            .flat_map(|i| i.tags.iter())
            .collect()
    }

    /// Services the dataplane serves, in sorted order and without duplicates.
    pub fn services(&self) -> Vec<Strng> {
        self.tag_set().values(SERVICE_TAG).cloned().collect()
    }
}

impl fmt::Display for Dataplane {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dataplane{{{} [{}]}}", self.key(), self.tag_set())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ErrorKind;
    use crate::test_helpers::{DataplaneBuilder, MeshBuilder};

    #[test]
    fn tag_set_is_order_independent() {
        let a = DataplaneBuilder::new()
            .with_tags([(SERVICE_TAG, "web"), ("version", "v1")])
            .with_tags([(SERVICE_TAG, "backend")])
            .build();
        let b = DataplaneBuilder::new()
            .with_tags([(SERVICE_TAG, "backend")])
            .with_tags([("version", "v1"), (SERVICE_TAG, "web")])
            .build();
        assert_eq!(a.tag_set(), b.tag_set());
        assert_eq!(a.tag_set().to_string(), "kuma.io/service=backend,web version=v1");
        assert_eq!(a.services(), vec![strng::new("backend"), strng::new("web")]);
    }

    #[test]
    fn enabled_backend_resolution() {
        let mesh = MeshBuilder::new("default")
            .with_builtin_backend("ca-1", Some("1h"))
            .with_enabled_backend("ca-1")
            .build();
        let backend = mesh.enabled_backend().unwrap();
        assert_eq!(backend.name, "ca-1");
        assert_eq!(backend.rotation().unwrap(), Duration::from_secs(3600));

        let missing = MeshBuilder::new("default")
            .with_builtin_backend("ca-1", None)
            .with_enabled_backend("ca-2")
            .build();
        let err = missing.enabled_backend().unwrap_err();
        assert!(matches!(err, Error::BackendNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Resolution);

        let disabled = MeshBuilder::new("default").build();
        assert_eq!(disabled.enabled_backend_name(), "");
        assert_eq!(
            disabled.enabled_backend().unwrap_err().kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn rotation_defaults_and_validation() {
        let mesh = MeshBuilder::new("default")
            .with_builtin_backend("no-rotation", None)
            .with_builtin_backend("garbage", Some("one hour"))
            .with_builtin_backend("zero", Some("0s"))
            .build();
        let backends = mesh.backends();
        assert_eq!(backends[0].rotation().unwrap(), DEFAULT_ROTATION_EXPIRATION);
        for b in &backends[1..] {
            let err = b.rotation().unwrap_err();
            assert!(matches!(err, Error::InvalidRotation { .. }), "{err}");
            assert_eq!(err.kind(), ErrorKind::Config);
        }
    }

    #[test]
    fn deserialize_mesh_and_dataplane() {
        let mesh: Mesh = serde_yaml::from_str(
            r#"
name: default
mtls:
  enabledBackend: ca-1
  backends:
  - name: ca-1
    type: builtin
    dpCert:
      rotation:
        expiration: 1h
"#,
        )
        .unwrap();
        assert_eq!(mesh.enabled_backend().unwrap().backend_type, "builtin");

        let dp: Dataplane = serde_yaml::from_str(
            r#"
mesh: default
name: backend-1
address: 192.168.0.1
inbound:
- port: 80
  servicePort: 8080
  tags:
    kuma.io/service: backend
"#,
        )
        .unwrap();
        assert_eq!(dp.key(), ResourceKey::new("default", "backend-1"));
        assert_eq!(dp.services(), vec![strng::new("backend")]);
    }
}
