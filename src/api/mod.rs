//! Browser upload server.
//!
//! - `GET /` serves the upload page.
//! - `GET /health` answers `{"status":"ok"}`.
//! - `POST /analyze?filename=<name>` takes the raw video as the request body
//!   and streams NDJSON: one line per incident as it is found, then a final
//!   `complete` or `error` line.
//!
//! Uploads are processed one at a time on the server thread. Each upload gets
//! its own spool file, classifier and pipeline.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use crate::config::ScanConfig;
use crate::detect::{build_classifier, ClassificationResult};
use crate::frame::jpeg_data_url;
use crate::ingest::file::extension_of;
use crate::ingest::FileSource;
use crate::pipeline::{PipelineError, ProgressObserver, SamplingOptions, SamplingPipeline};
use crate::report::{Incident, IncidentReport};

const MAX_HEADER_BYTES: usize = 8192;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Rejected uploads are drained up to this size so the client sees the reply.
const MAX_DRAIN_BYTES: u64 = 16 * 1024 * 1024;

const UPLOAD_PAGE: &str = include_str!("upload.html");

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ScanConfig,
}

impl ApiServer {
    pub fn new(cfg: ScanConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .api
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.api.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind upload server on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, shutdown_thread) {
                log::error!("upload api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, cfg: ScanConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg) {
                    log::warn!("upload api request failed: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ScanConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    log::debug!("upload api: {} {} from {}", request.method, request.path, peer);
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") | ("GET", "/index.html") => {
            write_response(
                &mut stream,
                200,
                "text/html; charset=utf-8",
                UPLOAD_PAGE.as_bytes(),
            )?;
        }
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, &json!({"status": "ok"}))?;
        }
        ("POST", "/analyze") => handle_analyze(stream, request, cfg)?,
        (_, "/" | "/index.html" | "/health" | "/analyze") => {
            write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        }
        _ => {
            write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
        }
    }
    Ok(())
}

fn handle_analyze(mut stream: TcpStream, request: HttpRequest, cfg: &ScanConfig) -> Result<()> {
    let length = match request.content_length() {
        Ok(Some(length)) => length,
        Ok(None) => {
            write_json_response(&mut stream, 411, &json!({"error": "length_required"}))?;
            return Ok(());
        }
        Err(err) => {
            write_json_response(
                &mut stream,
                400,
                &json!({"error": "bad_request", "message": err.to_string()}),
            )?;
            return Ok(());
        }
    };
    if length > cfg.api.max_upload_bytes {
        discard_body(&mut stream, &request.leftover, length)?;
        write_json_response(
            &mut stream,
            413,
            &json!({"error": "upload_too_large", "limit_bytes": cfg.api.max_upload_bytes}),
        )?;
        return Ok(());
    }
    if length == 0 {
        write_json_response(&mut stream, 400, &json!({"error": "empty_upload"}))?;
        return Ok(());
    }
    let filename = request.filename();
    let extension = match filename.as_deref().map(extension_of) {
        Some(Ok(ext)) => ext,
        Some(Err(err)) => {
            discard_body(&mut stream, &request.leftover, length)?;
            write_json_response(
                &mut stream,
                415,
                &json!({"error": "unsupported_media_type", "message": err.to_string()}),
            )?;
            return Ok(());
        }
        None => {
            discard_body(&mut stream, &request.leftover, length)?;
            write_json_response(&mut stream, 400, &json!({"error": "missing_filename"}))?;
            return Ok(());
        }
    };

    let options = SamplingOptions::from_config(cfg)?;
    let mut classifier = match build_classifier(cfg) {
        Ok(classifier) => classifier,
        Err(err) => {
            discard_body(&mut stream, &request.leftover, length)?;
            log::error!("upload api: classifier unavailable: {:#}", err);
            write_json_response(
                &mut stream,
                503,
                &json!({"error": "classifier_unavailable", "message": err.to_string()}),
            )?;
            return Ok(());
        }
    };

    stream.set_read_timeout(Some(BODY_READ_TIMEOUT))?;
    let body = Cursor::new(request.leftover).chain(&stream);
    let mut source = match FileSource::from_reader(body, &extension, length) {
        Ok(source) => source,
        Err(err) => {
            write_json_response(
                &mut stream,
                400,
                &json!({"error": "upload_incomplete", "message": format!("{:#}", err)}),
            )?;
            return Ok(());
        }
    };
    log::info!(
        "upload api: analyzing {} bytes ({})",
        length,
        filename.unwrap_or_default()
    );

    let mut responder = NdjsonResponder::new(&mut stream);
    let mut pipeline = SamplingPipeline::new(options);
    let result = pipeline.run(&mut source, &mut classifier, &mut responder);
    responder.finish(&result)?;
    finish_response(&stream);
    Ok(())
}

/// Streams pipeline progress to the client as newline-delimited JSON.
///
/// The status line is written with the first line of output, so a run that
/// fails before any incident still gets an error status.
struct NdjsonResponder<W: Write> {
    out: W,
    header_sent: bool,
    broken: bool,
}

impl<W: Write> NdjsonResponder<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            header_sent: false,
            broken: false,
        }
    }

    fn send_header(&mut self, status: u16) -> std::io::Result<()> {
        if self.header_sent {
            return Ok(());
        }
        self.header_sent = true;
        let header = format!(
            "{}\r\nContent-Type: application/x-ndjson\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            status_line(status)
        );
        self.out.write_all(header.as_bytes())
    }

    fn send_line(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.out.flush()
    }

    fn finish(mut self, result: &Result<IncidentReport, PipelineError>) -> Result<()> {
        let (status, line) = match result {
            Ok(report) => (200, complete_line(report)?),
            Err(err) => {
                let status = match err {
                    PipelineError::Decode { .. } | PipelineError::StreamDecode { .. } => 422,
                    PipelineError::Classification { .. } => 502,
                    _ => 500,
                };
                (status, error_line(err)?)
            }
        };
        self.send_header(status)?;
        self.send_line(&line)?;
        Ok(())
    }
}

impl<W: Write> ProgressObserver for NdjsonResponder<W> {
    fn on_incident(&mut self, incident: &Incident, caption: &str) {
        if self.broken {
            return;
        }
        let image = match incident.frame.annotated().encode_jpeg(80) {
            Ok(jpeg) => Some(jpeg_data_url(&jpeg)),
            Err(err) => {
                log::warn!("upload api: snapshot encode failed: {:#}", err);
                None
            }
        };
        let line = json!({
            "type": "incident",
            "frame_index": incident.frame_index,
            "timestamp": incident.timestamp,
            "seconds": incident.timestamp.as_secs(),
            "caption": caption,
            "reply": incident.reply,
            "image": image,
        });
        let sent = self.send_header(200).and_then(|_| self.send_line(&line));
        if let Err(err) = sent {
            log::warn!("upload api: client went away during analysis: {}", err);
            self.broken = true;
        }
    }

    fn on_classified(&mut self, frame_index: u64, result: &ClassificationResult) {
        log::debug!(
            "upload api: frame {} classified (incident={})",
            frame_index,
            result.is_incident
        );
    }
}

fn complete_line(report: &IncidentReport) -> Result<Value> {
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), json!("complete"));
    }
    Ok(value)
}

fn error_line(err: &PipelineError) -> Result<Value> {
    let incidents = match err.partial() {
        Some(partial) => serde_json::to_value(partial.incidents())?,
        None => json!([]),
    };
    Ok(json!({
        "type": "error",
        "kind": err.kind(),
        "message": err.to_string(),
        "incidents": incidents,
    }))
}

/// Read and drop the rest of a rejected upload so the reply is not reset.
fn discard_body(stream: &mut TcpStream, leftover: &[u8], length: u64) -> Result<()> {
    let remaining = length.saturating_sub(leftover.len() as u64);
    if remaining > MAX_DRAIN_BYTES {
        log::debug!(
            "upload api: not draining {} byte body of rejected upload",
            remaining
        );
        return Ok(());
    }
    stream.set_read_timeout(Some(HEADER_READ_TIMEOUT))?;
    if let Err(err) = std::io::copy(&mut (&*stream).take(remaining), &mut std::io::sink()) {
        log::debug!("upload api: draining rejected body failed: {}", err);
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(HEADER_READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request head too large"));
        }
    };
    let leftover = data.split_off(header_end + 4);
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        leftover,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    write_response(stream, status, "application/json", &serde_json::to_vec(body)?)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    finish_response(stream);
    Ok(())
}

/// Half-close after the reply so the client reads it before any reset.
fn finish_response(stream: &TcpStream) {
    if let Err(err) = stream.shutdown(Shutdown::Write) {
        log::debug!("upload api: shutdown after reply failed: {}", err);
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        502 => "HTTP/1.1 502 Bad Gateway",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    /// Body bytes that arrived together with the request head.
    leftover: Vec<u8>,
}

impl HttpRequest {
    fn content_length(&self) -> Result<Option<u64>> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid content-length '{}'", value)),
            None => Ok(None),
        }
    }

    /// Upload name from `?filename=` or the `X-Filename` header.
    fn filename(&self) -> Option<String> {
        let from_query = Url::parse("http://localhost")
            .and_then(|base| base.join(&self.raw_path))
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == "filename")
                    .map(|(_, value)| value.into_owned())
            });
        from_query
            .or_else(|| self.headers.get("x-filename").cloned())
            .filter(|name| !name.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::report::VideoTimestamp;

    fn request(raw_path: &str, headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "POST".to_string(),
            path: raw_path.split('?').next().unwrap().to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw_path: raw_path.to_string(),
            leftover: Vec::new(),
        }
    }

    #[test]
    fn filename_from_query_or_header() {
        let req = request("/analyze?filename=dash%20cam.MOV", &[]);
        assert_eq!(req.filename().as_deref(), Some("dash cam.MOV"));

        let req = request("/analyze", &[("x-filename", "clip.mp4")]);
        assert_eq!(req.filename().as_deref(), Some("clip.mp4"));

        let req = request("/analyze?filename=", &[]);
        assert_eq!(req.filename(), None);
    }

    #[test]
    fn content_length_parsing() {
        let req = request("/analyze", &[("content-length", "42")]);
        assert_eq!(req.content_length().unwrap(), Some(42));
        let req = request("/analyze", &[("content-length", "lots")]);
        assert!(req.content_length().is_err());
        let req = request("/analyze", &[]);
        assert_eq!(req.content_length().unwrap(), None);
    }

    #[test]
    fn responder_defers_status_until_first_line() -> Result<()> {
        let mut out = Vec::new();
        {
            let mut responder = NdjsonResponder::new(&mut out);
            let incident = Incident {
                frame_index: 30,
                timestamp: VideoTimestamp::from_secs(1),
                frame: Frame::from_rgb(30, 8, 8, vec![40u8; 8 * 8 * 3])?,
                reply: "Yes".to_string(),
            };
            responder.on_incident(&incident, &incident.caption());
            responder.finish(&Ok(IncidentReport::default()))?;
        }
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "incident");
        assert_eq!(lines[0]["caption"], "Accident at 0:00:01");
        assert!(lines[0]["image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert_eq!(lines[1]["type"], "complete");
        Ok(())
    }

    #[test]
    fn decode_failure_before_output_maps_to_422() -> Result<()> {
        let mut out = Vec::new();
        let responder = NdjsonResponder::new(&mut out);
        let err = PipelineError::Decode {
            cause: anyhow!("not a video"),
        };
        responder.finish(&Err(err))?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 422 "));
        assert!(text.contains(r#""kind":"decode""#));
        Ok(())
    }
}
