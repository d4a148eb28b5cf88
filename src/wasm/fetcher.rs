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
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::ClientConfig;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("failed reading response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("unexpected status code {0}")]
    Status(http::StatusCode),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("tls setup: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    // Only transport level failures and server errors are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            Error::Client(_) | Error::Body(_) | Error::Timeout(_) => true,
            Error::Status(code) => code.is_server_error(),
            Error::Request(_) | Error::Tls(_) => false,
        }
    }
}

/// Fetcher downloads the raw bytes of a module.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, Error>;
}

/// HttpFetcher fetches modules over HTTP or HTTPS, retrying transient failures.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    request_timeout: Duration,
    max_retries: u32,
}

fn client_config() -> Result<ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("failed to load native certificate: {e}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("loaded {added} root certificates ({ignored} ignored)");
    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(5)));
        http.enforce_http(false);
        let https: HttpsConnector<HttpConnector> = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_config()?)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(https);
        Ok(HttpFetcher {
            client,
            request_timeout: config.http_request_timeout,
            max_retries: config.http_request_max_retries,
        })
    }

    async fn fetch_once(&self, url: &Url) -> Result<Bytes, Error> {
        let req = http::Request::get(url.as_str()).body(Empty::<Bytes>::new())?;
        let fetch = async {
            let resp = self.client.request(req).await?;
            if !resp.status().is_success() {
                return Err(Error::Status(resp.status()));
            }
            Ok::<_, Error>(resp.into_body().collect().await?.to_bytes())
        };
        tokio::time::timeout(self.request_timeout, fetch)
            .await
            .map_err(|_| Error::Timeout(self.request_timeout))?
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, Error> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(b) => {
                    debug!(%url, size=b.len(), "fetched module");
                    return Ok(b);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(%url, "fetch failed ({e}), retrying in {backoff:?} (attempt {attempt})");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(MAX_BACKOFF, backoff * 2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Status(http::StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(!Error::Status(http::StatusCode::NOT_FOUND).is_retryable());
        assert!(!Error::Status(http::StatusCode::FORBIDDEN).is_retryable());
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_retries() {
        let cfg = Config {
            http_request_timeout: Duration::from_millis(200),
            http_request_max_retries: 1,
            ..Config::default()
        };
        let fetcher = HttpFetcher::new(&cfg).unwrap();
        // Port 1 on localhost is not expected to be listening.
        let url = Url::parse("http://127.0.0.1:1/module.wasm").unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error {err}");
    }
}
