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

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use super::ErrorKind;
use crate::metrics::Recorder;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub reason: ErrorKind,
}

/// A certificate was signed and cached.
pub struct CertGenerated;

/// Regeneration was attempted and failed.
pub struct GenerationFailed(pub ErrorKind);

#[derive(Default)]
pub struct Metrics {
    pub cert_generation: Counter,
    pub cert_generation_failures: Family<FailureLabels, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self::default();
        m.register(registry);
        m
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "cert_generation",
            "The total number of dataplane certificates generated",
            self.cert_generation.clone(),
        );
        registry.register(
            "cert_generation_failures",
            "The total number of failed dataplane certificate generations",
            self.cert_generation_failures.clone(),
        );
    }
}

impl Recorder<CertGenerated, u64> for Metrics {
    fn record(&self, _: &CertGenerated, count: u64) {
        self.cert_generation.inc_by(count);
    }
}

impl Recorder<GenerationFailed, u64> for Metrics {
    fn record(&self, event: &GenerationFailed, count: u64) {
        self.cert_generation_failures
            .get_or_create(&FailureLabels { reason: event.0 })
            .inc_by(count);
    }
}
