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
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use once_cell::sync::Lazy;
use prometheus_client::registry::Registry;
use prost_types::Any;
use tracing::error;
use url::Url;

use crate::telemetry;
use crate::wasm::cache::{self, GetOptions, ModuleCache};
use crate::wasm::fetcher::{self, Fetcher};
use crate::wasm::metrics::Metrics;
use crate::xds::envoy::config::core::v3::{
    AsyncDataSource, HttpUri, RemoteDataSource, TypedExtensionConfig, async_data_source,
};
use crate::xds::envoy::extensions::filters::http::wasm::v3::Wasm;
use crate::xds::envoy::extensions::wasm::v3::{PluginConfig, VmConfig, plugin_config};
use crate::xds::{self, EXTENSION_CONFIG_TYPE, WASM_HTTP_FILTER_TYPE};

/// The smallest valid Wasm module: the magic number and version 1, with no sections.
pub const WASM_MODULE: &[u8] = b"\0asm\x01\0\0\0";

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

pub fn wasm_metrics() -> Arc<Metrics> {
    let mut registry = Registry::default();
    Arc::new(Metrics::new(&mut registry))
}

/// MockCache serves modules from an in-memory table of uri to local path, and records
/// every lookup it sees.
#[derive(Default)]
pub struct MockCache {
    modules: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<GetOptions>>,
}

impl MockCache {
    pub fn insert(&self, uri: &str, path: &str) {
        self.modules
            .lock()
            .unwrap()
            .insert(uri.to_string(), path.to_string());
    }

    pub fn calls(&self) -> Vec<GetOptions> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModuleCache for MockCache {
    async fn get(&self, opts: GetOptions) -> Result<String, cache::Error> {
        self.calls.lock().unwrap().push(opts.clone());
        self.modules
            .lock()
            .unwrap()
            .get(&opts.uri)
            .cloned()
            .ok_or(cache::Error::Download(fetcher::Error::Status(
                http::StatusCode::NOT_FOUND,
            )))
    }
}

/// MockFetcher serves module bytes from memory; unknown URLs are a 404.
#[derive(Default)]
pub struct MockFetcher {
    modules: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<usize>,
}

impl MockFetcher {
    pub fn insert(&self, url: &str, module: &[u8]) {
        self.modules
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::copy_from_slice(module));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, fetcher::Error> {
        *self.calls.lock().unwrap() += 1;
        self.modules
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or(fetcher::Error::Status(http::StatusCode::NOT_FOUND))
    }
}

/// Builds a Wasm filter running `vm`.
pub fn wasm_filter(vm: VmConfig, fail_open: bool) -> Wasm {
    Wasm {
        config: Some(PluginConfig {
            name: "plugin".to_string(),
            root_id: "root".to_string(),
            fail_open,
            vm: Some(plugin_config::Vm::VmConfig(vm)),
            ..Default::default()
        }),
    }
}

/// Builds a Wasm filter loading its module from `uri`.
pub fn remote_wasm_filter(uri: &str, sha256: &str, fail_open: bool) -> Wasm {
    wasm_filter(
        VmConfig {
            vm_id: "vm".to_string(),
            runtime: "envoy.wasm.runtime.v8".to_string(),
            code: Some(AsyncDataSource {
                specifier: Some(async_data_source::Specifier::Remote(RemoteDataSource {
                    http_uri: Some(HttpUri {
                        uri: uri.to_string(),
                        timeout: None,
                        http_upstream_type: None,
                    }),
                    sha256: sha256.to_string(),
                    retry_policy: None,
                })),
            }),
            ..Default::default()
        },
        fail_open,
    )
}

/// Wraps a filter config into an extension config resource.
pub fn extension_config(name: &str, typed_config: Any) -> Any {
    let ec = TypedExtensionConfig {
        name: name.to_string(),
        typed_config: Some(typed_config),
    };
    xds::to_any(&EXTENSION_CONFIG_TYPE, &ec).unwrap()
}

/// Builds an extension config resource for a Wasm filter loading its module from `uri`.
pub fn remote_wasm_extension(name: &str, uri: &str, fail_open: bool) -> Any {
    let wasm = remote_wasm_filter(uri, "", fail_open);
    extension_config(name, xds::to_any(&WASM_HTTP_FILTER_TYPE, &wasm).unwrap())
}

/// Converts a JSON object into a protobuf Struct. Non-object values yield an empty struct.
pub fn json_to_struct(json: serde_json::Value) -> prost_types::Struct {
    match json {
        serde_json::Value::Object(m) => map_to_struct(m),
        other => {
            error!("expected a JSON object, got {other}");
            prost_types::Struct::default()
        }
    }
}

fn map_to_struct(json: serde_json::Map<String, serde_json::Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: json
            .into_iter()
            .map(|(k, v)| (k, json_to_value(v)))
            .collect(),
    }
}

fn json_to_value(json: serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind::*;
    use serde_json::Value::*;

    prost_types::Value {
        kind: Some(match json {
            Null => NullValue(0),
            Bool(v) => BoolValue(v),
            Number(n) => NumberValue(n.as_f64().unwrap_or_else(|| {
                error!("error parsing JSON number: {}", n);
                0f64
            })),
            String(s) => StringValue(s),
            Array(v) => ListValue(prost_types::ListValue {
                values: v.into_iter().map(json_to_value).collect(),
            }),
            Object(v) => StructValue(map_to_struct(v)),
        }),
    }
}
