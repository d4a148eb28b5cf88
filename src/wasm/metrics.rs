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

use std::fmt::Write;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};

use crate::metrics::Recorder;

pub struct Metrics {
    pub conversion_duration: Histogram,
    pub conversions: Family<ConversionLabels, Counter>,
    pub cache_lookups: Family<CacheLookupLabels, Counter>,
    pub remote_fetches: Family<RemoteFetchLabels, Counter>,
    pub cache_entries: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let conversion_duration =
            Histogram::new(vec![0.00001f64, 0.0001, 0.001, 0.01, 0.1, 1.0, 10.0].into_iter());
        registry.register_with_unit(
            "wasm_config_conversion_duration",
            "Total time in seconds taken to convert a batch of Wasm extension configs (unstable)",
            Unit::Seconds,
            conversion_duration.clone(),
        );

        let conversions = Family::default();
        registry.register(
            "wasm_config_conversion_count",
            "Number of Wasm extension config conversions, by result (unstable)",
            conversions.clone(),
        );

        let cache_lookups = Family::default();
        registry.register(
            "wasm_cache_lookup_count",
            "Number of Wasm module cache lookups, by whether they hit (unstable)",
            cache_lookups.clone(),
        );

        let remote_fetches = Family::default();
        registry.register(
            "wasm_remote_fetch_count",
            "Number of remote Wasm module fetches, by result (unstable)",
            remote_fetches.clone(),
        );

        let cache_entries = Gauge::default();
        registry.register(
            "wasm_cache_entries",
            "Number of Wasm modules held in the local cache (unstable)",
            cache_entries.clone(),
        );

        Self {
            conversion_duration,
            conversions,
            cache_lookups,
            remote_fetches,
            cache_entries,
        }
    }
}

/// Result of converting a single extension config.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum ConversionStatus {
    NoRemoteLoad,
    ConversionSuccess,
    FetchFailure,
    MissRemoteFetchHint,
    MarshalFailure,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::NoRemoteLoad => "no_remote_load",
            ConversionStatus::ConversionSuccess => "conversion_success",
            ConversionStatus::FetchFailure => "fetch_failure",
            ConversionStatus::MissRemoteFetchHint => "miss_remote_fetch_hint",
            ConversionStatus::MarshalFailure => "marshal_failure",
        }
    }
}

impl EncodeLabelValue for ConversionStatus {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ConversionLabels {
    pub result: ConversionStatus,
}

impl Recorder<ConversionStatus, u64> for Metrics {
    fn record(&self, status: &ConversionStatus, count: u64) {
        self.conversions
            .get_or_create(&ConversionLabels { result: *status })
            .inc_by(count);
    }
}

/// Event for a whole conversion pass; recorded with its duration.
pub struct BatchConversion;

impl Recorder<BatchConversion, Duration> for Metrics {
    fn record(&self, _: &BatchConversion, duration: Duration) {
        self.conversion_duration.observe(duration.as_secs_f64());
    }
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
}

impl EncodeLabelValue for CacheLookup {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        match self {
            CacheLookup::Hit => writer.write_str("true"),
            CacheLookup::Miss => writer.write_str("false"),
        }
    }
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLookupLabels {
    pub hit: CacheLookup,
}

impl Recorder<CacheLookup, u64> for Metrics {
    fn record(&self, lookup: &CacheLookup, count: u64) {
        self.cache_lookups
            .get_or_create(&CacheLookupLabels { hit: *lookup })
            .inc_by(count);
    }
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum FetchResult {
    Success,
    DownloadFailure,
    ChecksumMismatched,
    FetchTimeout,
    InvalidModule,
}

impl EncodeLabelValue for FetchResult {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(match self {
            FetchResult::Success => "success",
            FetchResult::DownloadFailure => "download_failure",
            FetchResult::ChecksumMismatched => "checksum_mismatched",
            FetchResult::FetchTimeout => "fetch_timeout",
            FetchResult::InvalidModule => "invalid_module",
        })
    }
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteFetchLabels {
    pub result: FetchResult,
}

impl Recorder<FetchResult, u64> for Metrics {
    fn record(&self, result: &FetchResult, count: u64) {
        self.remote_fetches
            .get_or_create(&RemoteFetchLabels { result: *result })
            .inc_by(count);
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;
    use crate::metrics::{IncrementRecorder, sub_registry};

    #[test]
    fn labels_use_snake_case_results() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(sub_registry(&mut registry));
        metrics.increment(&ConversionStatus::MissRemoteFetchHint);
        metrics.increment(&CacheLookup::Hit);
        metrics.increment(&FetchResult::ChecksumMismatched);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(
            "istio_wasm_config_conversion_count_total{result=\"miss_remote_fetch_hint\"} 1"
        ));
        assert!(out.contains("istio_wasm_cache_lookup_count_total{hit=\"true\"} 1"));
        assert!(
            out.contains("istio_wasm_remote_fetch_count_total{result=\"checksum_mismatched\"} 1")
        );
    }
}
