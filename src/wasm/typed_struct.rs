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

//! Conversion of a `TypedStruct` payload into the native Wasm filter message.
//!
//! The struct holds the JSON mapping of the message, so both the proto field names and
//! their lowerCamelCase forms are accepted. Unknown fields are rejected: silently
//! dropping them would change the filter once it is re-encoded.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost::Message;
use prost_types::value::Kind;
use prost_types::{Any, Struct, Value};

use crate::xds::envoy::config::core::v3::{
    AsyncDataSource, BackoffStrategy, DataSource, HttpUri, RemoteDataSource, RetryPolicy,
    async_data_source, data_source, http_uri,
};
use crate::xds::envoy::extensions::filters::http::wasm::v3::Wasm;
use crate::xds::envoy::extensions::wasm::v3::{
    CapabilityRestrictionConfig, EnvironmentVariables, FailurePolicy, PluginConfig,
    ReloadConfig, SanitizationConfig, VmConfig, plugin_config,
};
use crate::xds::{STRING_VALUE_TYPE, STRUCT_TYPE};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("field {0}: expected {1}")]
    WrongKind(String, &'static str),
    #[error("unknown field {0}")]
    UnknownField(String),
    #[error("field {0}: invalid duration: {1}")]
    Duration(String, String),
    #[error("field {0}: invalid base64: {1}")]
    Base64(String, String),
    #[error("field {0}: unsupported Any type {1:?}")]
    UnsupportedAny(String, String),
    #[error("field {0}: invalid enum value {1}")]
    Enum(String, String),
    #[error("field {0}: only one of {1} may be set")]
    MultipleOneof(String, &'static str),
}

type Result<T> = std::result::Result<T, Error>;

/// Converts the value of a TypedStruct naming the Wasm HTTP filter into the filter.
pub fn wasm_from_struct(s: Struct) -> Result<Wasm> {
    let mut f = Fields::new(s, "");
    let config = f.object("config")?.map(plugin_config).transpose()?;
    f.finish()?;
    Ok(Wasm { config })
}

fn plugin_config(mut f: Fields) -> Result<PluginConfig> {
    let pc = PluginConfig {
        name: f.string("name")?,
        root_id: f.string("root_id")?,
        configuration: f.any("configuration")?,
        fail_open: f.bool("fail_open")?,
        capability_restriction_config: f
            .object("capability_restriction_config")?
            .map(capability_restriction_config)
            .transpose()?,
        failure_policy: f
            .enumeration("failure_policy", |s| {
                FailurePolicy::from_str_name(s).map(|p| p as i32)
            })?,
        reload_config: f.object("reload_config")?.map(reload_config).transpose()?,
        vm: f
            .object("vm_config")?
            .map(vm_config)
            .transpose()?
            .map(plugin_config::Vm::VmConfig),
    };
    f.finish()?;
    Ok(pc)
}

fn capability_restriction_config(mut f: Fields) -> Result<CapabilityRestrictionConfig> {
    let mut allowed_capabilities = HashMap::new();
    if let Some(mut caps) = f.object("allowed_capabilities")? {
        // Map keys are capability names, not field names.
        for cap in caps.keys() {
            if let Some(sanitization) = caps.object(&cap)? {
                sanitization.finish()?;
            }
            allowed_capabilities.insert(cap, SanitizationConfig {});
        }
        caps.finish()?;
    }
    f.finish()?;
    Ok(CapabilityRestrictionConfig {
        allowed_capabilities,
    })
}

fn reload_config(mut f: Fields) -> Result<ReloadConfig> {
    let reload = ReloadConfig {
        backoff: f.object("backoff")?.map(backoff_strategy).transpose()?,
    };
    f.finish()?;
    Ok(reload)
}

fn vm_config(mut f: Fields) -> Result<VmConfig> {
    let vm = VmConfig {
        vm_id: f.string("vm_id")?,
        runtime: f.string("runtime")?,
        code: f.object("code")?.map(async_data_source).transpose()?,
        configuration: f.any("configuration")?,
        allow_precompiled: f.bool("allow_precompiled")?,
        nack_on_code_cache_miss: f.bool("nack_on_code_cache_miss")?,
        environment_variables: f
            .object("environment_variables")?
            .map(environment_variables)
            .transpose()?,
    };
    f.finish()?;
    Ok(vm)
}

fn environment_variables(mut f: Fields) -> Result<EnvironmentVariables> {
    let env = EnvironmentVariables {
        host_env_keys: f.string_list("host_env_keys")?,
        key_values: f.string_map("key_values")?,
    };
    f.finish()?;
    Ok(env)
}

fn async_data_source(mut f: Fields) -> Result<AsyncDataSource> {
    let local = f.object("local")?.map(self::data_source).transpose()?;
    let remote = f.object("remote")?.map(remote_data_source).transpose()?;
    let specifier = match (local, remote) {
        (Some(_), Some(_)) => return Err(f.oneof_error("local, remote")),
        (Some(l), None) => Some(async_data_source::Specifier::Local(l)),
        (None, Some(r)) => Some(async_data_source::Specifier::Remote(r)),
        (None, None) => None,
    };
    f.finish()?;
    Ok(AsyncDataSource { specifier })
}

fn data_source(mut f: Fields) -> Result<DataSource> {
    use data_source::Specifier;
    let mut set = Vec::new();
    if let Some(v) = f.optional_string("filename")? {
        set.push(Specifier::Filename(v));
    }
    if let Some(v) = f.optional_string("inline_bytes")? {
        let b = STANDARD
            .decode(v)
            .map_err(|e| Error::Base64(f.path("inline_bytes"), e.to_string()))?;
        set.push(Specifier::InlineBytes(b));
    }
    if let Some(v) = f.optional_string("inline_string")? {
        set.push(Specifier::InlineString(v));
    }
    if let Some(v) = f.optional_string("environment_variable")? {
        set.push(Specifier::EnvironmentVariable(v));
    }
    if set.len() > 1 {
        return Err(f.oneof_error(
            "filename, inline_bytes, inline_string, environment_variable",
        ));
    }
    f.finish()?;
    Ok(DataSource {
        specifier: set.pop(),
    })
}

fn remote_data_source(mut f: Fields) -> Result<RemoteDataSource> {
    let remote = RemoteDataSource {
        http_uri: f.object("http_uri")?.map(self::http_uri).transpose()?,
        sha256: f.string("sha256")?,
        retry_policy: f.object("retry_policy")?.map(retry_policy).transpose()?,
    };
    f.finish()?;
    Ok(remote)
}

fn http_uri(mut f: Fields) -> Result<HttpUri> {
    let uri = HttpUri {
        uri: f.string("uri")?,
        timeout: f.duration("timeout")?,
        http_upstream_type: f
            .optional_string("cluster")?
            .map(http_uri::HttpUpstreamType::Cluster),
    };
    f.finish()?;
    Ok(uri)
}

fn backoff_strategy(mut f: Fields) -> Result<BackoffStrategy> {
    let backoff = BackoffStrategy {
        base_interval: f.duration("base_interval")?,
        max_interval: f.duration("max_interval")?,
    };
    f.finish()?;
    Ok(backoff)
}

fn retry_policy(mut f: Fields) -> Result<RetryPolicy> {
    let policy = RetryPolicy {
        retry_back_off: f
            .object("retry_back_off")?
            .map(backoff_strategy)
            .transpose()?,
        num_retries: f.uint32("num_retries")?,
    };
    f.finish()?;
    Ok(policy)
}

/// Returns the JSON name of a proto field: `vm_config` becomes `vmConfig`.
fn json_name(proto: &str) -> String {
    let mut out = String::with_capacity(proto.len());
    let mut upper = false;
    for c in proto.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Fields is a cursor over the fields of a struct. Every accessor removes the field it
/// reads, so anything left when `finish` is called is unknown.
struct Fields {
    fields: BTreeMap<String, Value>,
    prefix: String,
}

impl Fields {
    fn new(s: Struct, prefix: &str) -> Self {
        Fields {
            fields: s.fields,
            prefix: prefix.to_string(),
        }
    }

    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn keys(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn oneof_error(&self, fields: &'static str) -> Error {
        Error::MultipleOneof(self.prefix.clone(), fields)
    }

    /// Removes the field under either of its names. Explicit nulls count as unset.
    fn take(&mut self, name: &str) -> Option<Kind> {
        let v = self
            .fields
            .remove(name)
            .or_else(|| self.fields.remove(&json_name(name)))?;
        match v.kind {
            None | Some(Kind::NullValue(_)) => None,
            Some(k) => Some(k),
        }
    }

    fn optional_string(&mut self, name: &str) -> Result<Option<String>> {
        match self.take(name) {
            None => Ok(None),
            Some(Kind::StringValue(s)) => Ok(Some(s)),
            Some(_) => Err(Error::WrongKind(self.path(name), "string")),
        }
    }

    fn string(&mut self, name: &str) -> Result<String> {
        Ok(self.optional_string(name)?.unwrap_or_default())
    }

    fn bool(&mut self, name: &str) -> Result<bool> {
        match self.take(name) {
            None => Ok(false),
            Some(Kind::BoolValue(b)) => Ok(b),
            Some(_) => Err(Error::WrongKind(self.path(name), "bool")),
        }
    }

    fn uint32(&mut self, name: &str) -> Result<Option<u32>> {
        let path = self.path(name);
        let wrong = || Error::WrongKind(path.clone(), "uint32");
        match self.take(name) {
            None => Ok(None),
            Some(Kind::NumberValue(n)) if n >= 0.0 && n <= u32::MAX as f64 && n.fract() == 0.0 => {
                Ok(Some(n as u32))
            }
            Some(Kind::StringValue(s)) => s.parse().map(Some).map_err(|_| wrong()),
            Some(_) => Err(wrong()),
        }
    }

    fn enumeration(&mut self, name: &str, parse: impl Fn(&str) -> Option<i32>) -> Result<i32> {
        match self.take(name) {
            None => Ok(0),
            Some(Kind::StringValue(s)) => {
                parse(&s).ok_or_else(|| Error::Enum(self.path(name), s.clone()))
            }
            Some(Kind::NumberValue(n)) if n.fract() == 0.0 => Ok(n as i32),
            Some(_) => Err(Error::WrongKind(self.path(name), "enum")),
        }
    }

    fn duration(&mut self, name: &str) -> Result<Option<prost_types::Duration>> {
        match self.take(name) {
            None => Ok(None),
            Some(Kind::StringValue(s)) => prost_types::Duration::from_str(&s)
                .map(Some)
                .map_err(|e| Error::Duration(self.path(name), e.to_string())),
            Some(_) => Err(Error::WrongKind(self.path(name), "duration string")),
        }
    }

    fn object(&mut self, name: &str) -> Result<Option<Fields>> {
        match self.take(name) {
            None => Ok(None),
            Some(Kind::StructValue(s)) => Ok(Some(Fields::new(s, &self.path(name)))),
            Some(_) => Err(Error::WrongKind(self.path(name), "object")),
        }
    }

    fn string_list(&mut self, name: &str) -> Result<Vec<String>> {
        match self.take(name) {
            None => Ok(Vec::new()),
            Some(Kind::ListValue(l)) => l
                .values
                .into_iter()
                .map(|v| match v.kind {
                    Some(Kind::StringValue(s)) => Ok(s),
                    _ => Err(Error::WrongKind(self.path(name), "list of strings")),
                })
                .collect(),
            Some(_) => Err(Error::WrongKind(self.path(name), "list of strings")),
        }
    }

    fn string_map(&mut self, name: &str) -> Result<HashMap<String, String>> {
        match self.take(name) {
            None => Ok(HashMap::new()),
            Some(Kind::StructValue(s)) => s
                .fields
                .into_iter()
                .map(|(k, v)| match v.kind {
                    Some(Kind::StringValue(s)) => Ok((k, s)),
                    _ => Err(Error::WrongKind(self.path(name), "map of strings")),
                })
                .collect(),
            Some(_) => Err(Error::WrongKind(self.path(name), "map of strings")),
        }
    }

    /// Reads an `Any` in its JSON form: `{"@type": ..., "value": ...}`. Only the wrapper
    /// types used for plugin configuration are understood.
    fn any(&mut self, name: &str) -> Result<Option<Any>> {
        let Some(mut f) = self.object(name)? else {
            return Ok(None);
        };
        let type_url = f.string("@type")?;
        let value = if type_url == STRING_VALUE_TYPE.as_str() {
            f.string("value")?.encode_to_vec()
        } else if type_url == STRUCT_TYPE.as_str() {
            match f.take("value") {
                None => Struct::default().encode_to_vec(),
                Some(Kind::StructValue(s)) => s.encode_to_vec(),
                Some(_) => return Err(Error::WrongKind(f.path("value"), "object")),
            }
        } else {
            return Err(Error::UnsupportedAny(self.path(name), type_url));
        };
        f.finish()?;
        Ok(Some(Any { type_url, value }))
    }

    fn finish(self) -> Result<()> {
        match self.fields.keys().next() {
            Some(k) => Err(Error::UnknownField(self.path(k))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_helpers::json_to_struct;

    fn decode(v: serde_json::Value) -> Result<Wasm> {
        wasm_from_struct(json_to_struct(v))
    }

    #[test]
    fn camel_and_snake_case() {
        let snake = decode(json!({
            "config": {
                "name": "plugin",
                "fail_open": true,
                "vm_config": {
                    "runtime": "envoy.wasm.runtime.v8",
                    "code": {"remote": {"http_uri": {"uri": "http://a/b.wasm", "timeout": "10s"}, "sha256": "abc"}},
                    "environment_variables": {"key_values": {"A": "1"}, "host_env_keys": ["HOME"]}
                }
            }
        }))
        .unwrap();
        let camel = decode(json!({
            "config": {
                "name": "plugin",
                "failOpen": true,
                "vmConfig": {
                    "runtime": "envoy.wasm.runtime.v8",
                    "code": {"remote": {"httpUri": {"uri": "http://a/b.wasm", "timeout": "10s"}, "sha256": "abc"}},
                    "environmentVariables": {"keyValues": {"A": "1"}, "hostEnvKeys": ["HOME"]}
                }
            }
        }))
        .unwrap();
        assert_eq!(snake, camel);

        let pc = snake.config.unwrap();
        assert!(pc.fail_open);
        let vm = pc.vm_config().unwrap();
        let Some(async_data_source::Specifier::Remote(remote)) =
            vm.code.as_ref().unwrap().specifier.as_ref()
        else {
            panic!("expected remote code");
        };
        let uri = remote.http_uri.as_ref().unwrap();
        assert_eq!(uri.uri, "http://a/b.wasm");
        assert_eq!(uri.timeout, Some(prost_types::Duration { seconds: 10, nanos: 0 }));
        assert_eq!(vm.environment_variables.as_ref().unwrap().key_values["A"], "1");
    }

    #[test]
    fn configuration_any() {
        let w = decode(json!({
            "config": {
                "configuration": {
                    "@type": "type.googleapis.com/google.protobuf.StringValue",
                    "value": "{\"header\": \"x\"}"
                },
                "failurePolicy": "FAIL_OPEN"
            }
        }))
        .unwrap();
        let pc = w.config.unwrap();
        assert_eq!(pc.failure_policy(), FailurePolicy::FailOpen);
        let any = pc.configuration.unwrap();
        assert_eq!(any.type_url, STRING_VALUE_TYPE.as_str());
        assert_eq!(
            String::decode(&any.value[..]).unwrap(),
            "{\"header\": \"x\"}"
        );
    }

    #[test]
    fn local_inline_bytes() {
        let w = decode(json!({
            "config": {"vmConfig": {"code": {"local": {"inlineBytes": "AGFzbQ=="}}}}
        }))
        .unwrap();
        let code = w.config.unwrap().vm_config().unwrap().code.clone().unwrap();
        assert_eq!(
            code.specifier,
            Some(async_data_source::Specifier::Local(DataSource {
                specifier: Some(data_source::Specifier::InlineBytes(b"\0asm".to_vec()))
            }))
        );
    }

    #[test]
    fn capability_and_reload_config() {
        let w = decode(json!({
            "config": {
                "capabilityRestrictionConfig": {
                    "allowedCapabilities": {"proxy_log": {}, "proxy_on_tick": null}
                },
                "reload_config": {"backoff": {"baseInterval": "1s", "maxInterval": "10s"}},
                "failurePolicy": "FAIL_RELOAD"
            }
        }))
        .unwrap();
        let pc = w.config.unwrap();
        assert_eq!(pc.failure_policy(), FailurePolicy::FailReload);
        let caps = pc.capability_restriction_config.unwrap().allowed_capabilities;
        assert_eq!(caps.len(), 2);
        assert_eq!(caps["proxy_log"], SanitizationConfig {});
        assert!(caps.contains_key("proxy_on_tick"));
        let backoff = pc.reload_config.unwrap().backoff.unwrap();
        assert_eq!(
            backoff.max_interval,
            Some(prost_types::Duration { seconds: 10, nanos: 0 })
        );

        assert_eq!(
            decode(json!({"config": {"reloadConfig": {"backoff": {"jitter": "1s"}}}})).unwrap_err(),
            Error::UnknownField("config.reload_config.backoff.jitter".to_string())
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            decode(json!({"config": {"vmConfig": {"bogus": 1}}})).unwrap_err(),
            Error::UnknownField("config.vm_config.bogus".to_string())
        );
        assert_eq!(
            decode(json!({"config": {"failOpen": "yes"}})).unwrap_err(),
            Error::WrongKind("config.fail_open".to_string(), "bool")
        );
        assert!(matches!(
            decode(json!({"config": {"vmConfig": {"code": {"local": {}, "remote": {}}}}})),
            Err(Error::MultipleOneof(..))
        ));
        assert!(matches!(
            decode(json!({"config": {"configuration": {"@type": "type.googleapis.com/foo.Bar"}}})),
            Err(Error::UnsupportedAny(..))
        ));
    }
}
