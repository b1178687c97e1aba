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

mod certificate;

pub use crate::tls::certificate::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("certificate generation: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("certificate parse: {0}")]
    CertificateParseNomError(#[from] x509_parser::nom::Err<x509_parser::error::X509Error>),

    #[error("certificate: {0}")]
    CertificateError(#[from] x509_parser::error::X509Error),

    #[error("certificate: {0}")]
    CertificateParseError(String),
}
