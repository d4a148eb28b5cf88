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

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use prost::Message;
use prost_types::Any;
use tracing::{debug, error, info, warn};

use crate::metrics::{IncrementRecorder, Timer};
use crate::strng::{self, Strng};
use crate::wasm::cache::{GetOptions, ModuleCache, PullPolicy};
use crate::wasm::metrics::{BatchConversion, ConversionStatus, Metrics};
use crate::wasm::{Error, WASM_POLICY_ENV, WASM_RESOURCE_VERSION_ENV, WASM_SECRET_ENV};
use crate::wasm::typed_struct;
use crate::xds::envoy::config::core::v3::{
    AsyncDataSource, DataSource, RemoteDataSource, TypedExtensionConfig, async_data_source,
    data_source,
};
use crate::xds::envoy::extensions::filters::http::rbac::v3::Rbac;
use crate::xds::envoy::extensions::filters::http::wasm::v3::Wasm;
use crate::xds::envoy::extensions::wasm::v3::{FailurePolicy, PluginConfig, VmConfig, plugin_config};
use crate::xds::envoy::service::discovery::v3::Resource;
use crate::xds::{
    self, EXTENSION_CONFIG_TYPE, RBAC_HTTP_FILTER_TYPE, TypedStruct, UDPA_TYPED_STRUCT_TYPE,
    WASM_HTTP_FILTER_TYPE, XDS_TYPED_STRUCT_TYPE,
};

/// Fetch deadline used when the resource does not declare a usable one.
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Checksum value the control plane sends when it has no checksum.
const NIL_CHECKSUM: &str = "nil";

/// Runtime of the deny-all placeholder. Without code the VM fails to start, so Envoy
/// rejects traffic through the filter.
const NULL_VM_RUNTIME: &str = "envoy.wasm.runtime.null";

// Field numbers on the path to the code source: Wasm.config, PluginConfig.vm_config, then
// VmConfig.code and VmConfig.environment_variables.
const WASM_CONFIG_FIELD: u32 = 1;
const PLUGIN_VM_CONFIG_FIELD: u32 = 3;
const VM_CODE_FIELD: u32 = 3;
const VM_ENVIRONMENT_FIELD: u32 = 7;

/// VisitedStore remembers the names of extension configs that have been converted
/// successfully at least once.
///
/// It lives as long as the owning agent; a failing conversion of a name in the store is
/// dropped instead of replaced with a deny-all filter, so a transient fetch failure does not
/// break a filter Envoy already runs.
#[derive(Default, Debug)]
pub struct VisitedStore {
    visited: Mutex<HashSet<Strng>>,
}

impl VisitedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, name: Strng) {
        self.visited.lock().unwrap().insert(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.visited.lock().unwrap().contains(name)
    }
}

/// Converter rewrites Wasm extension configs that load their module remotely so that they
/// reference a local copy of the module instead.
pub struct Converter {
    cache: Arc<dyn ModuleCache>,
    visited: Arc<VisitedStore>,
    metrics: Arc<Metrics>,
}

enum Conversion {
    /// Not a remotely loaded Wasm filter; the resource is left as is.
    NoRemoteLoad,
    Converted(Any),
    Failed {
        name: Strng,
        fail_open: bool,
        error: Error,
    },
}

impl Conversion {
    fn status(&self) -> ConversionStatus {
        match self {
            Conversion::NoRemoteLoad => ConversionStatus::NoRemoteLoad,
            Conversion::Converted(_) => ConversionStatus::ConversionSuccess,
            Conversion::Failed { error, .. } => error.status(),
        }
    }
}

/// What to emit in place of a resource. A dropped resource is left out of the output.
enum Resolution {
    Keep(Any),
    Drop,
}

/// The encodings a Wasm filter is accepted in.
enum WasmPayload {
    Native(Wasm),
    TypedStruct(Wasm),
    Other,
}

impl WasmPayload {
    fn decode(any: &Any) -> Self {
        let url = any.type_url.as_str();
        if url == WASM_HTTP_FILTER_TYPE.as_str() {
            return match xds::from_any::<Wasm>(url, any) {
                Ok(w) => WasmPayload::Native(w),
                Err(e) => {
                    debug!("failed to decode wasm filter: {e}");
                    WasmPayload::Other
                }
            };
        }
        if url != UDPA_TYPED_STRUCT_TYPE.as_str() && url != XDS_TYPED_STRUCT_TYPE.as_str() {
            return WasmPayload::Other;
        }
        let ts = match xds::from_any::<TypedStruct>(url, any) {
            Ok(ts) => ts,
            Err(e) => {
                debug!("failed to decode typed struct: {e}");
                return WasmPayload::Other;
            }
        };
        if ts.type_url != WASM_HTTP_FILTER_TYPE.as_str() {
            return WasmPayload::Other;
        }
        match typed_struct::wasm_from_struct(ts.value.unwrap_or_default()) {
            Ok(w) => WasmPayload::TypedStruct(w),
            Err(e) => {
                warn!("failed to convert typed struct into wasm filter, passing it through: {e}");
                WasmPayload::Other
            }
        }
    }
}

/// Control plane data carried in reserved VM environment variables.
#[derive(Debug, Default)]
struct ReservedEnv {
    pull_secret: Option<Bytes>,
    pull_policy: PullPolicy,
    resource_version: String,
}

impl ReservedEnv {
    /// Removes the reserved variables from the VM environment. Envoy must never see them.
    fn extract(vm: &mut VmConfig, uri: &str) -> Result<Self, Error> {
        let Some(env) = vm.environment_variables.as_mut() else {
            return Ok(ReservedEnv::default());
        };
        let pull_secret = match env.key_values.remove(WASM_SECRET_ENV) {
            // Set but empty means the secret was expected and is missing.
            Some(s) if s.is_empty() => return Err(Error::MissingPullSecret(uri.to_string())),
            Some(s) => Some(Bytes::from(s)),
            None => None,
        };
        let pull_policy = env
            .key_values
            .remove(WASM_POLICY_ENV)
            .and_then(|p| PullPolicy::from_str_name(&p))
            .unwrap_or_default();
        let resource_version = env
            .key_values
            .remove(WASM_RESOURCE_VERSION_ENV)
            .unwrap_or_default();
        if env.key_values.is_empty() && env.host_env_keys.is_empty() {
            vm.environment_variables = None;
        }
        Ok(ReservedEnv {
            pull_secret,
            pull_policy,
            resource_version,
        })
    }
}

/// A filter fails open if it sets the `fail_open` flag or, as Envoy also honors, the
/// `FAIL_OPEN` failure policy.
fn is_fail_open(pc: &PluginConfig) -> bool {
    pc.fail_open || pc.failure_policy() == FailurePolicy::FailOpen
}

/// Returns the VM config and its remote code source, if the filter loads its module remotely.
fn remote_vm(wasm: &mut Wasm) -> Option<(&mut VmConfig, RemoteDataSource)> {
    let vm = wasm.config.as_mut()?.vm_config_mut()?;
    let remote = match vm.code.as_ref()?.specifier.as_ref()? {
        async_data_source::Specifier::Remote(remote) => remote.clone(),
        async_data_source::Specifier::Local(_) => return None,
    };
    Some((vm, remote))
}

fn fetch_timeout(remote: &RemoteDataSource) -> Duration {
    remote
        .http_uri
        .as_ref()
        .and_then(|u| u.timeout)
        .and_then(|t| Duration::try_from(t).ok())
        .filter(|t| !t.is_zero())
        .unwrap_or(DEFAULT_FETCH_TIMEOUT)
}

/// Encodes the rewritten filter. A natively encoded filter is edited in place, replacing only
/// the VM code and environment, so that fields we do not model reach Envoy unchanged.
fn encode_filter(original: Option<&[u8]>, wasm: &Wasm) -> Result<Any, xds::Error> {
    let vm = wasm.config.as_ref().and_then(PluginConfig::vm_config);
    let (Some(original), Some(vm)) = (original, vm) else {
        return xds::to_any(&WASM_HTTP_FILTER_TYPE, wasm);
    };
    let replacement = VmConfig {
        code: vm.code.clone(),
        environment_variables: vm.environment_variables.clone(),
        ..Default::default()
    }
    .encode_to_vec();
    let value = xds::wire::rewrite_message(
        original,
        &[WASM_CONFIG_FIELD, PLUGIN_VM_CONFIG_FIELD],
        &|msg| xds::wire::replace_fields(msg, &[VM_CODE_FIELD, VM_ENVIRONMENT_FIELD], &replacement),
    )?;
    Ok(Any {
        type_url: WASM_HTTP_FILTER_TYPE.to_string(),
        value,
    })
}

fn extension_config(name: &str, typed_config: Any) -> Result<Any, xds::Error> {
    let ec = TypedExtensionConfig {
        name: name.to_string(),
        typed_config: Some(typed_config),
    };
    xds::to_any(&EXTENSION_CONFIG_TYPE, &ec)
}

/// Builds an extension config whose Wasm filter can never start, so that traffic through it
/// is rejected.
pub fn deny_all_filter(name: &str) -> Result<Any, xds::Error> {
    let wasm = Wasm {
        config: Some(PluginConfig {
            vm: Some(plugin_config::Vm::VmConfig(VmConfig {
                runtime: NULL_VM_RUNTIME.to_string(),
                ..Default::default()
            })),
            ..Default::default()
        }),
    };
    extension_config(name, xds::to_any(&WASM_HTTP_FILTER_TYPE, &wasm)?)
}

/// Builds an extension config holding an RBAC filter without rules, which allows all traffic.
pub fn allow_all_filter(name: &str) -> Result<Any, xds::Error> {
    extension_config(name, xds::to_any(&RBAC_HTTP_FILTER_TYPE, &Rbac {})?)
}

impl Converter {
    pub fn new(
        cache: Arc<dyn ModuleCache>,
        visited: Arc<VisitedStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Converter {
            cache,
            visited,
            metrics,
        }
    }

    /// Converts a batch of extension configs, returning the resources to send to Envoy in
    /// input order and whether the update must be NACKed.
    ///
    /// Empty entries pass through untouched.
    pub async fn convert_batch(&self, resources: Vec<Option<Any>>) -> (Vec<Option<Any>>, bool) {
        let _timer = Timer::new(self.metrics.as_ref(), BatchConversion);
        let results = join_all(resources.into_iter().map(|r| async move {
            match r {
                None => (Some(None), false),
                Some(r) => match self.resolve(r).await {
                    (Resolution::Keep(r), nack) => (Some(Some(r)), nack),
                    (Resolution::Drop, nack) => (None, nack),
                },
            }
        }))
        .await;

        let mut nack = false;
        let converted = results
            .into_iter()
            .filter_map(|(r, n)| {
                nack |= n;
                r
            })
            .collect();
        (converted, nack)
    }

    /// Like [Converter::convert_batch], for resources of the incremental protocol. The
    /// delta metadata of each resource is kept.
    pub async fn convert_delta_batch(&self, resources: Vec<Resource>) -> (Vec<Resource>, bool) {
        let _timer = Timer::new(self.metrics.as_ref(), BatchConversion);
        let results = join_all(resources.into_iter().map(|mut r| async move {
            let Some(inner) = r.resource.take() else {
                return (Some(r), false);
            };
            match self.resolve(inner).await {
                (Resolution::Keep(inner), nack) => {
                    r.resource = Some(inner);
                    (Some(r), nack)
                }
                (Resolution::Drop, nack) => {
                    debug!(name=%r.name, version=%r.version, "dropping delta resource");
                    (None, nack)
                }
            }
        }))
        .await;

        let mut nack = false;
        let converted = results
            .into_iter()
            .filter_map(|(r, n)| {
                nack |= n;
                r
            })
            .collect();
        (converted, nack)
    }

    /// Converts a single resource and decides what replaces it, and whether it requires a
    /// NACK.
    async fn resolve(&self, resource: Any) -> (Resolution, bool) {
        let conversion = self.convert_one(&resource).await;
        self.metrics.increment(&conversion.status());
        match conversion {
            Conversion::NoRemoteLoad => (Resolution::Keep(resource), false),
            Conversion::Converted(converted) => (Resolution::Keep(converted), false),
            Conversion::Failed {
                name,
                fail_open: true,
                error,
            } => {
                error!(%name, "wasm remote load failed, failing open: {error}");
                match allow_all_filter(&name) {
                    Ok(f) => (Resolution::Keep(f), false),
                    Err(e) => {
                        error!(%name, "failed to build allow-all filter, dropping resource: {e}");
                        (Resolution::Drop, false)
                    }
                }
            }
            Conversion::Failed {
                name,
                fail_open: false,
                error,
            } => {
                error!(%name, "wasm remote load failed: {error}");
                if self.visited.contains(&name) {
                    warn!(%name, "keeping previously loaded wasm filter, dropping update");
                    return (Resolution::Drop, true);
                }
                match deny_all_filter(&name) {
                    Ok(f) => (Resolution::Keep(f), true),
                    Err(e) => {
                        error!(%name, "failed to build deny-all filter, dropping resource: {e}");
                        (Resolution::Drop, true)
                    }
                }
            }
        }
    }

    async fn convert_one(&self, resource: &Any) -> Conversion {
        let mut ec: TypedExtensionConfig = match xds::from_any(&EXTENSION_CONFIG_TYPE, resource)
        {
            Ok(ec) => ec,
            Err(e) => {
                debug!("cannot decode extension config: {e}");
                return Conversion::NoRemoteLoad;
            }
        };
        let (mut wasm, native) = match ec.typed_config.as_ref().map(WasmPayload::decode) {
            Some(WasmPayload::Native(w)) => (w, true),
            Some(WasmPayload::TypedStruct(w)) => {
                debug!(name=%ec.name, "converted typed struct into wasm filter");
                (w, false)
            }
            Some(WasmPayload::Other) | None => return Conversion::NoRemoteLoad,
        };
        let name = strng::new(&ec.name);
        let fail_open = wasm.config.as_ref().is_some_and(is_fail_open);
        let Some((vm, remote)) = remote_vm(&mut wasm) else {
            return Conversion::NoRemoteLoad;
        };

        let path = match self.fetch(&name, vm, &remote).await {
            Ok(path) => path,
            Err(error) => {
                return Conversion::Failed {
                    name,
                    fail_open,
                    error,
                };
            }
        };
        vm.code = Some(AsyncDataSource {
            specifier: Some(async_data_source::Specifier::Local(DataSource {
                specifier: Some(data_source::Specifier::Filename(path)),
            })),
        });

        let original = ec.typed_config.take().filter(|_| native).map(|a| a.value);
        let encoded = encode_filter(original.as_deref(), &wasm).and_then(|typed_config| {
            ec.typed_config = Some(typed_config);
            xds::to_any(&EXTENSION_CONFIG_TYPE, &ec)
        });
        match encoded {
            Ok(any) => {
                self.visited.mark(name.clone());
                info!(%name, "converted wasm remote load to local file");
                Conversion::Converted(any)
            }
            Err(e) => Conversion::Failed {
                name,
                fail_open,
                error: e.into(),
            },
        }
    }

    /// Resolves the remote module of `vm` into a local path, stripping the reserved
    /// environment variables on the way.
    async fn fetch(
        &self,
        name: &Strng,
        vm: &mut VmConfig,
        remote: &RemoteDataSource,
    ) -> Result<String, Error> {
        let declared_uri = remote.http_uri.as_ref().map(|u| u.uri.as_str());
        let env = ReservedEnv::extract(vm, declared_uri.unwrap_or_default())?;
        let uri = declared_uri.ok_or(Error::MissingHttpUri)?.to_string();

        let checksum = if remote.sha256 == NIL_CHECKSUM {
            String::new()
        } else {
            remote.sha256.clone()
        };
        let opts = GetOptions {
            uri: uri.clone(),
            checksum,
            resource_name: name.clone(),
            resource_version: env.resource_version,
            timeout: fetch_timeout(remote),
            pull_secret: env.pull_secret,
            pull_policy: env.pull_policy,
        };
        debug!(%name, %uri, timeout=?opts.timeout, policy=?opts.pull_policy, "fetching wasm module");
        self.cache
            .get(opts)
            .await
            .map_err(|source| Error::Fetch { uri, source })
    }
}
