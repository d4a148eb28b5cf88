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

use std::sync::Arc;

use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::xds;

pub use cache::{GetOptions, LocalFileCache, ModuleCache, PullPolicy};
pub use convert::*;
pub use fetcher::{Fetcher, HttpFetcher};
pub use metrics::Metrics;

pub mod cache;
mod convert;
pub mod fetcher;
pub mod metrics;
mod typed_struct;

/// Environment variable carrying the image pull secret. Set by the control plane for the
/// agent only; it must never reach Envoy.
pub const WASM_SECRET_ENV: &str = "ISTIO_META_WASM_IMAGE_PULL_SECRET";
/// Environment variable carrying the image pull policy.
pub const WASM_POLICY_ENV: &str = "ISTIO_META_WASM_IMAGE_PULL_POLICY";
/// Environment variable carrying the resource version of the plugin, used as a cache hint.
pub const WASM_RESOURCE_VERSION_ENV: &str = "ISTIO_META_WASM_PLUGIN_RESOURCE_VERSION";

/// Reasons a Wasm extension config with a remote load could not be converted.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot fetch Wasm module {0}: missing image pulling secret")]
    MissingPullSecret(String),
    #[error("cannot fetch Wasm module {uri}: {source}")]
    Fetch {
        uri: String,
        #[source]
        source: cache::Error,
    },
    #[error("wasm remote fetch does not have httpUri specified")]
    MissingHttpUri,
    #[error("failed to marshal new extension config: {0}")]
    Marshal(#[from] xds::Error),
}

impl Error {
    pub fn status(&self) -> metrics::ConversionStatus {
        use metrics::ConversionStatus;
        match self {
            Error::MissingPullSecret(_) | Error::Fetch { .. } => ConversionStatus::FetchFailure,
            Error::MissingHttpUri => ConversionStatus::MissRemoteFetchHint,
            Error::Marshal(_) => ConversionStatus::MarshalFailure,
        }
    }
}

/// Builds a converter that fetches modules over HTTP into the on-disk cache described by
/// `config`, registering its metrics under the `istio` prefix. The cache is returned so the
/// caller can drive [LocalFileCache::run_purge].
pub fn new_converter(
    config: &Config,
    visited: Arc<VisitedStore>,
    registry: &mut Registry,
) -> Result<(Converter, Arc<LocalFileCache>), fetcher::Error> {
    let metrics = Arc::new(Metrics::new(crate::metrics::sub_registry(registry)));
    let fetcher = Arc::new(HttpFetcher::new(config)?);
    let cache = Arc::new(LocalFileCache::new(config, fetcher, metrics.clone()));
    Ok((Converter::new(cache.clone(), visited, metrics), cache))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use prometheus_client::encoding::text::encode;

    use super::*;
    use crate::config;
    use crate::test_helpers::{self, WASM_MODULE};

    #[tokio::test]
    async fn converter_from_env_config() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plugin.wasm");
        std::fs::write(&src, WASM_MODULE).unwrap();
        let cfg = config::construct_config(HashMap::from([
            (
                "WASM_MODULE_CACHE_DIR".to_string(),
                dir.path().join("cache").display().to_string(),
            ),
            ("WASM_PURGE_INTERVAL".to_string(), "100ms".to_string()),
            ("WASM_MODULE_EXPIRY".to_string(), "200ms".to_string()),
        ]))
        .unwrap();

        let mut registry = Registry::default();
        let (converter, cache) =
            new_converter(&cfg, Arc::new(VisitedStore::new()), &mut registry).unwrap();
        let uri = url::Url::from_file_path(&src).unwrap();
        let (out, nack) = converter
            .convert_batch(vec![Some(test_helpers::remote_wasm_extension(
                "ns.plugin",
                uri.as_str(),
                false,
            ))])
            .await;
        assert!(!nack);
        assert_eq!(out.len(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.dir(), dir.path().join("cache"));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let purge = tokio::spawn(cache.clone().run_purge(async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(cache.is_empty());
        tx.send(()).unwrap();
        purge.await.unwrap();

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(text.contains("istio_wasm_cache_entries 0"));
    }
}
