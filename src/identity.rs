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

use std::fmt;
use std::str::FromStr;

use prometheus_client::encoding::EncodeLabelValue;

use crate::mesh::ResourceKey;
use crate::strng::{self, Strng};
use crate::{store, tls};

pub mod builtin;
pub use builtin::BuiltinCaManager;

mod ca;
pub use ca::*;

pub mod manager;
pub use manager::*;

pub mod metrics;
pub use metrics::Metrics;

pub mod policy;

mod provider;
pub use provider::*;

#[derive(Debug, PartialEq, Eq, Clone, Hash, PartialOrd, Ord)]
pub enum Identity {
    Spiffe { trust_domain: Strng, service: Strng },
}

impl Identity {
    /// Identity of a service within a mesh; the mesh is the trust domain.
    pub fn service(mesh: &str, service: &str) -> Self {
        Identity::Spiffe {
            trust_domain: strng::new(mesh),
            service: strng::new(service),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identity::Spiffe {
                trust_domain,
                service,
            } => write!(f, "spiffe://{trust_domain}/{service}"),
        }
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const URI_PREFIX: &str = "spiffe://";
        let Some(rest) = s.strip_prefix(URI_PREFIX) else {
            return Err(Error::Spiffe(s.to_string()));
        };
        match rest.split_once('/') {
            Some((trust_domain, service))
                if !trust_domain.is_empty() && !service.is_empty() && !service.contains('/') =>
            {
                Ok(Identity::service(trust_domain, service))
            }
            _ => Err(Error::Spiffe(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mTLS is not enabled on mesh {0}")]
    MtlsDisabled(Strng),
    #[error("enabled CA backend {backend} is not defined on mesh {mesh}")]
    BackendNotFound { mesh: Strng, backend: Strng },
    #[error("CA backend type {0} is not registered")]
    UnknownBackendType(Strng),
    #[error("CA backend {backend} is not provisioned for mesh {mesh}")]
    NotProvisioned { mesh: Strng, backend: Strng },
    #[error("invalid rotation expiration {value:?} for backend {backend}: {reason}")]
    InvalidRotation {
        backend: Strng,
        value: String,
        reason: String,
    },
    #[error("dataplane {dataplane} does not belong to mesh {mesh}")]
    MeshMismatch { dataplane: ResourceKey, mesh: Strng },
    #[error("dataplane {0} has no service tag")]
    NoServiceTag(ResourceKey),
    #[error("invalid spiffe identity: {0}")]
    Spiffe(String),
    #[error("failed to sign certificate: {0}")]
    Signing(#[from] tls::Error),
    #[error("certificate returned by backend {backend} is missing SAN {expected}")]
    SanMismatch { backend: Strng, expected: Identity },
    #[error("CA backend {backend} returned an empty root bundle for mesh {mesh}")]
    EmptyBundle { mesh: Strng, backend: Strng },
    #[error("secret store: {0}")]
    Store(#[from] store::Error),
}

impl From<rcgen::Error> for Error {
    fn from(value: rcgen::Error) -> Self {
        Error::Signing(value.into())
    }
}

/// ErrorKind groups errors by what went wrong, independent of the backend involved.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ErrorKind {
    /// The CA backend could not be resolved for the mesh.
    Resolution,
    /// The resolved backend failed to produce certificates.
    Signing,
    /// The mesh or dataplane configuration is malformed.
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BackendNotFound { .. }
            | Error::UnknownBackendType(_)
            | Error::NotProvisioned { .. } => ErrorKind::Resolution,
            Error::MtlsDisabled(_)
            | Error::InvalidRotation { .. }
            | Error::MeshMismatch { .. }
            | Error::NoServiceTag(_)
            | Error::Spiffe(_) => ErrorKind::Config,
            Error::Signing(_)
            | Error::SanMismatch { .. }
            | Error::EmptyBundle { .. }
            | Error::Store(_) => ErrorKind::Signing,
        }
    }
}
