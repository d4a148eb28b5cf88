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
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const WASM_MODULE_CACHE_DIR: &str = "WASM_MODULE_CACHE_DIR";
const WASM_MODULE_EXPIRY: &str = "WASM_MODULE_EXPIRY";
const WASM_PURGE_INTERVAL: &str = "WASM_PURGE_INTERVAL";
const WASM_HTTP_REQUEST_TIMEOUT: &str = "WASM_HTTP_REQUEST_TIMEOUT";
const WASM_HTTP_REQUEST_MAX_RETRIES: &str = "WASM_HTTP_REQUEST_MAX_RETRIES";

const DEFAULT_CACHE_DIR: &str = "./var/lib/istio/data";
const DEFAULT_MODULE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HTTP_REQUEST_MAX_RETRIES: u32 = 5;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory fetched modules are stored in.
    pub cache_dir: PathBuf,
    /// How long an unused module stays in the cache.
    #[serde(with = "serde_dur")]
    pub module_expiry: Duration,
    #[serde(with = "serde_dur")]
    pub purge_interval: Duration,
    /// Deadline for a single HTTP request when fetching a module.
    #[serde(with = "serde_dur")]
    pub http_request_timeout: Duration,
    pub http_request_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            module_expiry: DEFAULT_MODULE_EXPIRY,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            http_request_timeout: DEFAULT_HTTP_REQUEST_TIMEOUT,
            http_request_max_retries: DEFAULT_HTTP_REQUEST_MAX_RETRIES,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// EnvDuration parses durations such as "90s" or "24h".
struct EnvDuration(Duration);

impl FromStr for EnvDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(EnvDuration).map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &HashMap<String, String>, key: &str) -> Result<Option<T>, Error> {
    match env.get(key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), val.clone())),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(
    env: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

fn parse_duration(
    env: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, Error> {
    parse::<EnvDuration>(env, key).map(|v| v.map(|d| d.0).unwrap_or(default))
}

/// Builds the configuration from the process environment.
pub fn parse_config() -> Result<Config, Error> {
    construct_config(std::env::vars().collect())
}

pub fn construct_config(env: HashMap<String, String>) -> Result<Config, Error> {
    let config = Config {
        cache_dir: parse_default(&env, WASM_MODULE_CACHE_DIR, PathBuf::from(DEFAULT_CACHE_DIR))?,
        module_expiry: parse_duration(&env, WASM_MODULE_EXPIRY, DEFAULT_MODULE_EXPIRY)?,
        purge_interval: parse_duration(&env, WASM_PURGE_INTERVAL, DEFAULT_PURGE_INTERVAL)?,
        http_request_timeout: parse_duration(
            &env,
            WASM_HTTP_REQUEST_TIMEOUT,
            DEFAULT_HTTP_REQUEST_TIMEOUT,
        )?,
        http_request_max_retries: parse_default(
            &env,
            WASM_HTTP_REQUEST_MAX_RETRIES,
            DEFAULT_HTTP_REQUEST_MAX_RETRIES,
        )?,
    };
    validate_config(config)
}

fn validate_config(config: Config) -> Result<Config, Error> {
    if config.purge_interval.is_zero() {
        return Err(Error::Invalid(format!(
            "{WASM_PURGE_INTERVAL} must be greater than zero"
        )));
    }
    if config.http_request_timeout.is_zero() {
        return Err(Error::Invalid(format!(
            "{WASM_HTTP_REQUEST_TIMEOUT} must be greater than zero"
        )));
    }
    Ok(config)
}

pub mod serde_dur {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{dur:?}"))
    }
}

impl Config {
    /// Renders the configuration for logging at startup.
    pub fn dump(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable config: {e}>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn config_defaults() {
        let cfg = construct_config(HashMap::new()).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.module_expiry, Duration::from_secs(86400));
        assert_eq!(cfg.http_request_max_retries, 5);
    }

    #[test]
    fn config_from_env() {
        let cfg = construct_config(env(&[
            (WASM_MODULE_CACHE_DIR, "/tmp/wasm"),
            (WASM_MODULE_EXPIRY, "90m"),
            (WASM_PURGE_INTERVAL, "10m"),
            (WASM_HTTP_REQUEST_TIMEOUT, "2s"),
            (WASM_HTTP_REQUEST_MAX_RETRIES, "0"),
        ]))
        .unwrap();
        assert_eq!(
            cfg,
            Config {
                cache_dir: PathBuf::from("/tmp/wasm"),
                module_expiry: Duration::from_secs(90 * 60),
                purge_interval: Duration::from_secs(600),
                http_request_timeout: Duration::from_secs(2),
                http_request_max_retries: 0,
            }
        );
        assert!(cfg.dump().contains("\"httpRequestTimeout\":\"2s\""));
    }

    #[test]
    fn config_from_process_env() {
        let cfg = parse_config().unwrap();
        assert!(!cfg.purge_interval.is_zero());
        assert!(cfg.dump().contains("\"purgeInterval\""));
    }

    #[test]
    fn config_invalid() {
        assert!(matches!(
            construct_config(env(&[(WASM_HTTP_REQUEST_MAX_RETRIES, "many")])),
            Err(Error::EnvVar(k, v)) if k == WASM_HTTP_REQUEST_MAX_RETRIES && v == "many"
        ));
        assert!(matches!(
            construct_config(env(&[(WASM_MODULE_EXPIRY, "soon")])),
            Err(Error::EnvVar(..))
        ));
        assert!(matches!(
            construct_config(env(&[(WASM_PURGE_INTERVAL, "0s")])),
            Err(Error::Invalid(_))
        ));
    }
}
