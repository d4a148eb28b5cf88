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

//! Message definitions for the subset of the Envoy and xDS schemas that the Wasm
//! conversion reads and writes. Field numbers follow the upstream .proto files, so these
//! messages are wire compatible with the full definitions. Fields we do not model are
//! dropped on decode; see `xds::wire` for editing an encoded message in place.

use crate::strng;
use crate::strng::Strng;

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod envoy {
    pub mod config {
        pub mod core {
            pub mod v3 {
                /// Message type for extension configuration.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct TypedExtensionConfig {
                    #[prost(string, tag = "1")]
                    pub name: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "2")]
                    pub typed_config: ::core::option::Option<::prost_types::Any>,
                }

                /// Data source consisting of a file, an inline value, or an environment variable.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct DataSource {
                    #[prost(oneof = "data_source::Specifier", tags = "1, 2, 3, 4")]
                    pub specifier: ::core::option::Option<data_source::Specifier>,
                }
                pub mod data_source {
                    #[derive(Clone, PartialEq, ::prost::Oneof)]
                    pub enum Specifier {
                        #[prost(string, tag = "1")]
                        Filename(::prost::alloc::string::String),
                        #[prost(bytes, tag = "2")]
                        InlineBytes(::prost::alloc::vec::Vec<u8>),
                        #[prost(string, tag = "3")]
                        InlineString(::prost::alloc::string::String),
                        #[prost(string, tag = "4")]
                        EnvironmentVariable(::prost::alloc::string::String),
                    }
                }

                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct BackoffStrategy {
                    #[prost(message, optional, tag = "1")]
                    pub base_interval: ::core::option::Option<::prost_types::Duration>,
                    #[prost(message, optional, tag = "2")]
                    pub max_interval: ::core::option::Option<::prost_types::Duration>,
                }

                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct RetryPolicy {
                    #[prost(message, optional, tag = "1")]
                    pub retry_back_off: ::core::option::Option<BackoffStrategy>,
                    #[prost(message, optional, tag = "2")]
                    pub num_retries: ::core::option::Option<u32>,
                }

                /// The message specifies how to fetch data from remote and how to verify it.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct RemoteDataSource {
                    #[prost(message, optional, tag = "1")]
                    pub http_uri: ::core::option::Option<HttpUri>,
                    /// SHA256 string for verifying data.
                    #[prost(string, tag = "2")]
                    pub sha256: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "3")]
                    pub retry_policy: ::core::option::Option<RetryPolicy>,
                }

                /// Async data source which support async data fetch.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct AsyncDataSource {
                    #[prost(oneof = "async_data_source::Specifier", tags = "1, 2")]
                    pub specifier: ::core::option::Option<async_data_source::Specifier>,
                }
                pub mod async_data_source {
                    #[derive(Clone, PartialEq, ::prost::Oneof)]
                    pub enum Specifier {
                        #[prost(message, tag = "1")]
                        Local(super::DataSource),
                        #[prost(message, tag = "2")]
                        Remote(super::RemoteDataSource),
                    }
                }

                /// Envoy external URI descriptor
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct HttpUri {
                    #[prost(string, tag = "1")]
                    pub uri: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "3")]
                    pub timeout: ::core::option::Option<::prost_types::Duration>,
                    #[prost(oneof = "http_uri::HttpUpstreamType", tags = "2")]
                    pub http_upstream_type: ::core::option::Option<http_uri::HttpUpstreamType>,
                }
                pub mod http_uri {
                    #[derive(Clone, PartialEq, ::prost::Oneof)]
                    pub enum HttpUpstreamType {
                        #[prost(string, tag = "2")]
                        Cluster(::prost::alloc::string::String),
                    }
                }
            }
        }
    }

    pub mod extensions {
        pub mod wasm {
            pub mod v3 {
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct EnvironmentVariables {
                    /// The keys of *Envoy's* environment variables exposed to this VM.
                    #[prost(string, repeated, tag = "1")]
                    pub host_env_keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                    /// Explicitly given key-value pairs to be injected to this VM.
                    #[prost(map = "string, string", tag = "2")]
                    pub key_values: ::std::collections::HashMap<
                        ::prost::alloc::string::String,
                        ::prost::alloc::string::String,
                    >,
                }

                /// Configuration for a Wasm VM.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct VmConfig {
                    #[prost(string, tag = "1")]
                    pub vm_id: ::prost::alloc::string::String,
                    #[prost(string, tag = "2")]
                    pub runtime: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "3")]
                    pub code: ::core::option::Option<
                        super::super::super::config::core::v3::AsyncDataSource,
                    >,
                    #[prost(message, optional, tag = "4")]
                    pub configuration: ::core::option::Option<::prost_types::Any>,
                    #[prost(bool, tag = "5")]
                    pub allow_precompiled: bool,
                    #[prost(bool, tag = "6")]
                    pub nack_on_code_cache_miss: bool,
                    #[prost(message, optional, tag = "7")]
                    pub environment_variables: ::core::option::Option<EnvironmentVariables>,
                }

                /// Base Configuration for Wasm Plugins e.g. filters and services.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct PluginConfig {
                    #[prost(string, tag = "1")]
                    pub name: ::prost::alloc::string::String,
                    #[prost(string, tag = "2")]
                    pub root_id: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "4")]
                    pub configuration: ::core::option::Option<::prost_types::Any>,
                    #[prost(bool, tag = "5")]
                    pub fail_open: bool,
                    #[prost(message, optional, tag = "6")]
                    pub capability_restriction_config:
                        ::core::option::Option<CapabilityRestrictionConfig>,
                    #[prost(enumeration = "FailurePolicy", tag = "7")]
                    pub failure_policy: i32,
                    #[prost(message, optional, tag = "8")]
                    pub reload_config: ::core::option::Option<ReloadConfig>,
                    #[prost(oneof = "plugin_config::Vm", tags = "3")]
                    pub vm: ::core::option::Option<plugin_config::Vm>,
                }
                pub mod plugin_config {
                    #[derive(Clone, PartialEq, ::prost::Oneof)]
                    pub enum Vm {
                        #[prost(message, tag = "3")]
                        VmConfig(super::VmConfig),
                    }
                }

                /// Restricts the host functions a plugin may call.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct CapabilityRestrictionConfig {
                    #[prost(map = "string, message", tag = "1")]
                    pub allowed_capabilities: ::std::collections::HashMap<
                        ::prost::alloc::string::String,
                        SanitizationConfig,
                    >,
                }

                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct SanitizationConfig {}

                /// Backoff used when reloading a plugin under the FAIL_RELOAD policy.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct ReloadConfig {
                    #[prost(message, optional, tag = "1")]
                    pub backoff: ::core::option::Option<
                        super::super::super::config::core::v3::BackoffStrategy,
                    >,
                }

                impl PluginConfig {
                    pub fn vm_config(&self) -> Option<&VmConfig> {
                        match &self.vm {
                            Some(plugin_config::Vm::VmConfig(vm)) => Some(vm),
                            None => None,
                        }
                    }

                    pub fn vm_config_mut(&mut self) -> Option<&mut VmConfig> {
                        match &mut self.vm {
                            Some(plugin_config::Vm::VmConfig(vm)) => Some(vm),
                            None => None,
                        }
                    }
                }

                #[derive(
                    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
                )]
                #[repr(i32)]
                pub enum FailurePolicy {
                    Unspecified = 0,
                    FailClosed = 1,
                    FailReload = 2,
                    FailOpen = 3,
                }

                impl FailurePolicy {
                    pub fn as_str_name(&self) -> &'static str {
                        match self {
                            FailurePolicy::Unspecified => "UNSPECIFIED",
                            FailurePolicy::FailClosed => "FAIL_CLOSED",
                            FailurePolicy::FailReload => "FAIL_RELOAD",
                            FailurePolicy::FailOpen => "FAIL_OPEN",
                        }
                    }

                    pub fn from_str_name(value: &str) -> Option<Self> {
                        match value {
                            "UNSPECIFIED" => Some(Self::Unspecified),
                            "FAIL_CLOSED" => Some(Self::FailClosed),
                            "FAIL_RELOAD" => Some(Self::FailReload),
                            "FAIL_OPEN" => Some(Self::FailOpen),
                            _ => None,
                        }
                    }
                }
            }
        }

        pub mod filters {
            pub mod http {
                pub mod wasm {
                    pub mod v3 {
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Wasm {
                            /// General Plugin configuration.
                            #[prost(message, optional, tag = "1")]
                            pub config: ::core::option::Option<
                                super::super::super::super::wasm::v3::PluginConfig,
                            >,
                        }
                    }
                }
                pub mod rbac {
                    pub mod v3 {
                        /// RBAC filter config. An empty config has no rules and allows all
                        /// traffic.
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Rbac {}
                    }
                }
            }
        }
    }

    pub mod service {
        pub mod discovery {
            pub mod v3 {
                /// Cache control properties for the resource.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct CacheControl {
                    #[prost(bool, tag = "1")]
                    pub do_not_cache: bool,
                }

                /// A resource as carried by the incremental (delta) protocol.
                #[derive(Clone, PartialEq, ::prost::Message)]
                pub struct Resource {
                    #[prost(string, tag = "3")]
                    pub name: ::prost::alloc::string::String,
                    #[prost(string, repeated, tag = "4")]
                    pub aliases: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
                    #[prost(string, tag = "1")]
                    pub version: ::prost::alloc::string::String,
                    #[prost(message, optional, tag = "2")]
                    pub resource: ::core::option::Option<::prost_types::Any>,
                    #[prost(message, optional, tag = "6")]
                    pub ttl: ::core::option::Option<::prost_types::Duration>,
                    #[prost(message, optional, tag = "7")]
                    pub cache_control: ::core::option::Option<CacheControl>,
                }
            }
        }
    }
}

/// `udpa.type.v1.TypedStruct` and `xds.type.v3.TypedStruct` share this layout.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedStruct {
    #[prost(string, tag = "1")]
    pub type_url: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<::prost_types::Struct>,
}

pub const EXTENSION_CONFIG_TYPE: Strng =
    strng::literal!("type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig");
pub const WASM_HTTP_FILTER_TYPE: Strng =
    strng::literal!("type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm");
pub const RBAC_HTTP_FILTER_TYPE: Strng =
    strng::literal!("type.googleapis.com/envoy.extensions.filters.http.rbac.v3.RBAC");
pub const UDPA_TYPED_STRUCT_TYPE: Strng =
    strng::literal!("type.googleapis.com/udpa.type.v1.TypedStruct");
pub const XDS_TYPED_STRUCT_TYPE: Strng =
    strng::literal!("type.googleapis.com/xds.type.v3.TypedStruct");
pub const STRING_VALUE_TYPE: Strng =
    strng::literal!("type.googleapis.com/google.protobuf.StringValue");
pub const STRUCT_TYPE: Strng = strng::literal!("type.googleapis.com/google.protobuf.Struct");
