use std::fs;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::metrics_server::cleanup_metrics_dir;

const JSON_CONTENT_TYPE: &str = "application/json";
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub target: String,
    pub metrics_dir: PathBuf,
    pub address: String,
    pub port: u16,
    pub wipe_metrics_dir: bool,
}

pub struct ExporterMetrics {
    registry: Registry,
    requests: IntCounterVec,
}

impl ExporterMetrics {
    pub fn new(target: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "metrics_server_requests_total",
                "Requests served by the metrics server",
            )
            .const_label("target", target),
            &["path", "status"],
        )?;
        let started = IntGauge::with_opts(
            Opts::new(
                "metrics_server_start_time_seconds",
                "Unix time the metrics server started",
            )
            .const_label("target", target),
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(started.clone()))?;
        started.set(unix_now());

        Ok(Self { registry, requests })
    }

    fn observe(&self, path: &str, status: u16) {
        let path = match request_path(path) {
            known @ ("/liveness" | "/readiness" | "/metrics") => known,
            _ => "other",
        };
        let status = status.to_string();
        self.requests
            .with_label_values(&[path, status.as_str()])
            .inc();
    }

    fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode exporter metrics")?;
        String::from_utf8(buffer).context("exporter metrics are not valid UTF-8")
    }
}

struct ExporterState {
    metrics_dir: PathBuf,
    metrics: ExporterMetrics,
}

pub async fn run(options: ExporterOptions) -> Result<()> {
    if options.wipe_metrics_dir {
        cleanup_metrics_dir(&options.metrics_dir)?;
    }

    let addr = format!("{}:{}", options.address, options.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics server at {addr}"))?;
    info!(metrics_target = %options.target, "metrics server listening on {addr}");

    serve(listener, &options).await
}

pub async fn serve(listener: TcpListener, options: &ExporterOptions) -> Result<()> {
    let state = Arc::new(ExporterState {
        metrics_dir: options.metrics_dir.clone(),
        metrics: ExporterMetrics::new(&options.target)?,
    });

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, &state).await {
                        warn!("failed to handle metrics request: {err}");
                    }
                });
            }
            Err(err) => {
                error!("metrics server accept failed: {err}");
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, state: &ExporterState) -> Result<()> {
    let request = read_http_request(&mut stream).await?;
    let response = route(&request, state);
    state.metrics.observe(&request.path, response.status_code);
    write_http_response(&mut stream, &response).await
}

fn route(request: &HttpRequest, state: &ExporterState) -> HttpResponse {
    let path = request_path(&request.path);
    if !matches!(path, "/liveness" | "/readiness" | "/metrics") {
        return HttpResponse::json(404, json!({ "status": "not found" }));
    }
    if request.method != "GET" {
        return HttpResponse::json(405, json!({ "status": "method not allowed" }));
    }

    match path {
        "/metrics" => match render_metrics(&state.metrics, &state.metrics_dir) {
            Ok(body) => HttpResponse {
                status_code: 200,
                content_type: METRICS_CONTENT_TYPE,
                body,
            },
            Err(err) => {
                error!("failed to render metrics: {err:#}");
                HttpResponse::json(500, json!({ "status": "error" }))
            }
        },
        _ => HttpResponse::json(200, json!({ "status": "ok" })),
    }
}

fn request_path(target: &str) -> &str {
    target.split('?').next().unwrap_or_default()
}

/// The exporter's own registry followed by every `*.prom` text file in the
/// metrics directory, in file name order.
fn render_metrics(metrics: &ExporterMetrics, metrics_dir: &Path) -> Result<String> {
    let mut body = metrics.encode()?;

    let mut files: Vec<PathBuf> = match fs::read_dir(metrics_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("prom"))
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read metrics dir {}", metrics_dir.display()))
        }
    };
    files.sort();

    for file in files {
        // Workers may be rewriting their file; skip it for this scrape.
        match fs::read_to_string(&file) {
            Ok(content) => {
                if !body.is_empty() && !body.ends_with('\n') {
                    body.push('\n');
                }
                body.push_str(&content);
            }
            Err(err) => warn!("skipping metrics file {}: {err}", file.display()),
        }
    }

    Ok(body)
}

async fn read_http_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    const MAX_HEADER_BYTES: usize = 16 * 1024;
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    loop {
        let read = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .context("timed out while reading metrics request")?
            .context("failed to read metrics request")?;

        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);

        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("metrics request headers exceed maximum size");
        }
    }

    parse_http_request(&buffer)
}

fn parse_http_request(buffer: &[u8]) -> Result<HttpRequest> {
    let raw = str::from_utf8(buffer).context("metrics request is not valid UTF-8")?;
    let head = raw.split("\r\n\r\n").next().unwrap_or_default();

    let request_line = head.split("\r\n").next().unwrap_or_default().trim();
    let mut request_parts = request_line.split_whitespace();
    let method = request_parts
        .next()
        .context("missing request method")?
        .to_string();
    let path = request_parts
        .next()
        .context("missing request path")?
        .to_string();

    Ok(HttpRequest { method, path })
}

async fn write_http_response(stream: &mut TcpStream, response: &HttpResponse) -> Result<()> {
    let reason = match response.status_code {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status_code,
        reason,
        response.content_type,
        response.body.len(),
    );
    if response.status_code == 405 {
        head.push_str("Allow: GET\r\n");
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .context("failed to write metrics response")?;
    stream
        .write_all(response.body.as_bytes())
        .await
        .context("failed to write metrics response")?;
    stream
        .flush()
        .await
        .context("failed to flush metrics response")
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[derive(Debug)]
struct HttpResponse {
    status_code: u16,
    content_type: &'static str,
    body: String,
}

impl HttpResponse {
    fn json(status_code: u16, body: serde_json::Value) -> Self {
        Self {
            status_code,
            content_type: JSON_CONTENT_TYPE,
            body: body.to_string(),
        }
    }
}
