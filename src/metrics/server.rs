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

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{CertInfo, SecretManager};
use crate::mesh::ResourceKey;

struct State {
    registry: Arc<Registry>,
    secrets: SecretManager,
}

/// Plaintext HTTP/1.1 server for metrics and cache introspection.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    state: Arc<State>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<Registry>,
        secrets: SecretManager,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind stats server to {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Server {
            listener,
            addr,
            state: Arc::new(State { registry, secrets }),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `shutdown` is cancelled. In-flight connections are not waited for.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(address=%self.addr, component="stats", "listener established");
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = self.listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("stats accept failed: {e}");
                            continue;
                        }
                    },
                };
                let state = self.state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(&state, req)) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .half_close(true)
                        .header_read_timeout(Duration::from_secs(2))
                        .max_buf_size(8 * 1024)
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%peer, "stats connection failed: {e}");
                    }
                });
            }
            info!("stats server terminated");
        })
    }
}

fn handle<B>(state: &State, req: Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" | "/stats/prometheus" => handle_metrics(&state.registry, &req),
        "/debug/certs" => handle_certs(&state.secrets),
        _ => plaintext_response(StatusCode::NOT_FOUND, String::new()),
    }
}

fn handle_metrics<B>(reg: &Registry, req: &Request<B>) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    if let Err(err) = encode(&mut buf, reg) {
        return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    response(StatusCode::OK, content_type(req), buf)
}

#[derive(serde::Serialize)]
struct CertDump {
    #[serde(flatten)]
    key: ResourceKey,
    #[serde(flatten)]
    info: CertInfo,
}

fn handle_certs(secrets: &SecretManager) -> Response<Full<Bytes>> {
    let dump: Vec<_> = secrets
        .dump()
        .into_iter()
        .map(|(key, info)| CertDump { key, info })
        .collect();
    match serde_json::to_string_pretty(&dump) {
        Ok(body) => response(StatusCode::OK, "application/json", body),
        Err(e) => plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn plaintext_response(code: StatusCode, body: String) -> Response<Full<Bytes>> {
    response(code, "text/plain; charset=utf-8", body)
}

fn response(code: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = code;
    if let Ok(v) = hyper::header::HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, v);
    }
    resp
}

#[derive(Default)]
enum ContentType {
    #[default]
    PlainText,
    OpenMetrics,
}

impl From<ContentType> for &str {
    fn from(c: ContentType) -> Self {
        match c {
            ContentType::PlainText => "text/plain; charset=utf-8",
            ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
        }
    }
}

fn content_type<T>(req: &Request<T>) -> &'static str {
    req.headers()
        .get_all(hyper::header::ACCEPT)
        .iter()
        .find_map(|v| {
            let v = v.to_str().unwrap_or_default().to_lowercase();
            match v.split(';').next().map(str::trim) {
                Some("application/openmetrics-text") => Some(ContentType::OpenMetrics),
                _ => None,
            }
        })
        .unwrap_or_default()
        .into()
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::test_helpers::{self, Fixture};

    #[test]
    fn test_content_type() {
        let plain_text_req = Request::new("I want some plain text");
        assert_eq!(content_type(&plain_text_req), "text/plain; charset=utf-8");

        let openmetrics_req = Request::builder()
            .header("X-Custom-Beep", "boop")
            .header("Accept", "application/json")
            .header("Accept", "application/openmetrics-text; other stuff")
            .body("I would like openmetrics")
            .unwrap();
        assert_eq!(
            content_type(&openmetrics_req),
            "application/openmetrics-text;charset=utf-8;version=1.0.0"
        );

        let unsupported_req_accept = Request::builder()
            .header("Accept", "application/json")
            .body("I would like some json")
            .unwrap();
        // asking for something we don't support, fall back to plaintext
        assert_eq!(
            content_type(&unsupported_req_accept),
            "text/plain; charset=utf-8"
        )
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp
    }

    #[tokio::test]
    async fn serves_metrics_and_certs() {
        let f = Fixture::new().await;
        f.secrets
            .get(&test_helpers::dataplane_backend(), &test_helpers::mesh_default())
            .await
            .unwrap();

        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            f.registry.clone(),
            f.secrets.clone(),
        )
        .await
        .unwrap();
        let addr = server.address();
        let shutdown = CancellationToken::new();
        let task = server.spawn(shutdown.clone());

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"), "{metrics}");
        assert!(metrics.contains("cert_generation_total 1"), "{metrics}");

        let certs = get(addr, "/debug/certs").await;
        assert!(certs.starts_with("HTTP/1.1 200"), "{certs}");
        assert!(certs.contains("application/json"), "{certs}");
        assert!(certs.contains(r#""name": "backend""#), "{certs}");
        assert!(certs.contains(r#""enabledBackend": "ca-1""#), "{certs}");

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

        shutdown.cancel();
        task.await.unwrap();
    }
}
