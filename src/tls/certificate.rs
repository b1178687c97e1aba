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

use std::io::Cursor;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use itertools::Itertools;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::identity::Identity;
use crate::tls::Error;

/// IdentityCertificate is the leaf certificate (plus any intermediates) and private key issued to
/// a dataplane, PEM encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityCertificate {
    pub pem_certs: Bytes,
    pub pem_key: Bytes,
}

/// CaBundle holds the PEM encoded roots (and intermediates) peers are validated against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaBundle {
    pub pem_certs: Vec<Bytes>,
}

#[derive(Clone, Debug)]
pub struct Certificate {
    pub expiry: Expiration,
    pub der: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expiration {
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl IdentityCertificate {
    /// Parses the leaf, which is the first certificate in the chain.
    pub fn leaf(&self) -> Result<Certificate, Error> {
        parse_cert(&self.pem_certs)
    }

    /// Returns the first identity of `expected` that the leaf does not carry as a URI SAN.
    pub fn missing_san(&self, expected: &[Identity]) -> Result<Option<Identity>, Error> {
        let found = self.leaf()?.identities()?;
        Ok(expected.iter().find(|id| !found.contains(id)).cloned())
    }

    pub fn has_private_key(&self) -> bool {
        let mut reader = std::io::BufReader::new(Cursor::new(&self.pem_key));
        matches!(rustls_pemfile::private_key(&mut reader), Ok(Some(_)))
    }
}

impl CaBundle {
    pub fn is_empty(&self) -> bool {
        self.pem_certs.iter().all(|c| c.is_empty())
    }

    pub fn certificates(&self) -> Result<Vec<Certificate>, Error> {
        self.pem_certs
            .iter()
            .map(|pem| parse_cert_multi(pem))
            .flatten_ok()
            .collect()
    }
}

impl Certificate {
    fn parsed(&self) -> Result<X509Certificate<'_>, Error> {
        Ok(x509_parser::parse_x509_certificate(&self.der)?.1)
    }

    pub fn serial(&self) -> Result<String, Error> {
        Ok(self.parsed()?.raw_serial_as_string())
    }

    pub fn subject(&self) -> Result<String, Error> {
        Ok(self.parsed()?.subject().to_string())
    }

    pub fn issuer(&self) -> Result<String, Error> {
        Ok(self.parsed()?.issuer().to_string())
    }

    pub fn is_ca(&self) -> Result<bool, Error> {
        Ok(self.parsed()?.is_ca())
    }

    /// SPIFFE identities carried as URI SANs. SANs which are not valid identities are skipped.
    pub fn identities(&self) -> Result<Vec<Identity>, Error> {
        let cert = self.parsed()?;
        let Some(names) = cert.subject_alternative_name()? else {
            return Ok(Vec::new());
        };
        Ok(names
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::URI(uri) => match Identity::from_str(uri) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        warn!("SAN {n} could not be parsed: {err}");
                        None
                    }
                },
                _ => None,
            })
            .collect())
    }
}

fn expiration(cert: &X509Certificate) -> Expiration {
    let at = |ts: i64| UNIX_EPOCH + Duration::from_secs(ts.try_into().unwrap_or_default());
    Expiration {
        not_before: at(cert.validity.not_before.timestamp()),
        not_after: at(cert.validity.not_after.timestamp()),
    }
}

fn to_certificate(der: &[u8]) -> Result<Certificate, Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)?;
    Ok(Certificate {
        expiry: expiration(&cert),
        der: Bytes::copy_from_slice(der),
    })
}

pub fn parse_cert(pem: &[u8]) -> Result<Certificate, Error> {
    parse_cert_multi(pem)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::CertificateParseError("no certificate".to_string()))
}

pub fn parse_cert_multi(pem: &[u8]) -> Result<Vec<Certificate>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    rustls_pemfile::certs(&mut reader)
        .map(|der| {
            let der = der.map_err(|e| Error::CertificateParseError(e.to_string()))?;
            to_certificate(der.as_ref())
        })
        .collect()
}
