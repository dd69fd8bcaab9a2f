use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use crashscan::{
    ApiKey, ClassificationRequest, Classifier, ClassifierError, FileConfig, FileSource,
    NoopObserver, OpenAiBackend, OpenAiConfig, PipelineError, SamplingOptions, SamplingPipeline,
};

struct CapturedRequest {
    head: String,
    body: Value,
}

/// Serves one canned reply per connection, in order, and records each request.
struct FakeCompletions {
    addr: SocketAddr,
    requests: mpsc::Receiver<CapturedRequest>,
}

impl FakeCompletions {
    fn start(replies: Vec<(u16, String)>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for (status, body) in replies {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                if let Ok(captured) = read_http_request(&mut stream) {
                    let _ = tx.send(captured);
                }
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        Ok(Self {
            addr,
            requests: rx,
        })
    }

    fn endpoint(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    fn next_request(&self) -> CapturedRequest {
        self.requests
            .recv_timeout(Duration::from_secs(5))
            .expect("fake server should receive a request")
    }
}

fn read_http_request(stream: &mut TcpStream) -> Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            anyhow::bail!("connection closed early");
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Ok(CapturedRequest {
        head,
        body: serde_json::from_slice(&body)?,
    })
}

fn completion(content: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
    .to_string()
}

fn backend(endpoint: String) -> OpenAiBackend {
    OpenAiBackend::new(OpenAiConfig {
        endpoint,
        model: "gpt-4o".to_string(),
        api_key: ApiKey::new("sk-test-key"),
        timeout: Duration::from_secs(5),
    })
}

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];
const PROMPT: &str = "Does this image show a car accident? Just answer Yes or No.";

#[test]
fn sends_prompt_image_and_bearer_key() -> Result<()> {
    let server = FakeCompletions::start(vec![(200, completion(" Yes "))])?;
    let mut classifier = backend(server.endpoint());
    assert_eq!(classifier.model(), "gpt-4o");

    let reply = classifier.classify(&ClassificationRequest {
        frame_index: 0,
        jpeg: JPEG,
        prompt: PROMPT,
        max_tokens: 10,
    })?;
    assert_eq!(reply, "Yes");

    let request = server.next_request();
    assert!(request.head.starts_with("POST /v1/chat/completions "));
    assert!(request
        .head
        .lines()
        .any(|line| line.eq_ignore_ascii_case("authorization: Bearer sk-test-key")));
    assert_eq!(request.body["model"], "gpt-4o");
    assert_eq!(request.body["max_tokens"], 10);
    let content = &request.body["messages"][0]["content"];
    assert_eq!(content[0]["text"], PROMPT);
    assert_eq!(
        content[1]["image_url"]["url"],
        "data:image/jpeg;base64,/9j/2Q=="
    );
    Ok(())
}

#[test]
fn error_status_is_reported_with_body() -> Result<()> {
    let server = FakeCompletions::start(vec![(
        500,
        r#"{"error":{"message":"upstream exploded"}}"#.to_string(),
    )])?;
    let mut classifier = backend(server.endpoint());

    let err = classifier
        .classify(&ClassificationRequest {
            frame_index: 0,
            jpeg: JPEG,
            prompt: PROMPT,
            max_tokens: 10,
        })
        .unwrap_err();

    match err {
        ClassifierError::Status { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("upstream exploded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn malformed_reply_is_an_error() -> Result<()> {
    let server = FakeCompletions::start(vec![(200, r#"{"choices":"nope"}"#.to_string())])?;
    let mut classifier = backend(server.endpoint());

    let err = classifier
        .classify(&ClassificationRequest {
            frame_index: 0,
            jpeg: JPEG,
            prompt: PROMPT,
            max_tokens: 10,
        })
        .unwrap_err();

    assert!(matches!(err, ClassifierError::MalformedResponse(_)));
    Ok(())
}

#[test]
fn unreachable_endpoint_is_transport_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    let mut classifier = backend(format!("http://{addr}/v1/chat/completions"));

    let err = classifier
        .classify(&ClassificationRequest {
            frame_index: 0,
            jpeg: JPEG,
            prompt: PROMPT,
            max_tokens: 10,
        })
        .unwrap_err();

    assert!(matches!(err, ClassifierError::Transport(_)));
    Ok(())
}

#[test]
fn pipeline_against_fake_service() -> Result<()> {
    let server = FakeCompletions::start(vec![
        (200, completion("No")),
        (200, completion("Yes.")),
        (200, completion("No")),
    ])?;
    let mut classifier = backend(server.endpoint());
    let mut source = FileSource::new(FileConfig {
        path: "stub://dashcam?frames=90&fps=30".to_string(),
    })?;
    let mut pipeline = SamplingPipeline::new(SamplingOptions::default());

    let report = pipeline.run(&mut source, &mut classifier, &mut NoopObserver)?;

    assert_eq!(report.frames_classified, 3);
    let timestamps: Vec<String> = report.timestamps().iter().map(|t| t.to_string()).collect();
    assert_eq!(timestamps, vec!["0:00:01"]);

    for _ in 0..3 {
        let request = server.next_request();
        let url = request.body["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        assert!(url.starts_with("data:image/jpeg;base64,/9j/"));
    }
    Ok(())
}

#[test]
fn service_failure_mid_run_keeps_earlier_incidents() -> Result<()> {
    let server = FakeCompletions::start(vec![
        (200, completion("Yes")),
        (429, r#"{"error":"rate limited"}"#.to_string()),
    ])?;
    let mut classifier = backend(server.endpoint());
    let mut source = FileSource::new(FileConfig {
        path: "stub://dashcam?frames=90&fps=30".to_string(),
    })?;
    let mut pipeline = SamplingPipeline::new(SamplingOptions::default());

    let err = pipeline
        .run(&mut source, &mut classifier, &mut NoopObserver)
        .unwrap_err();

    match err {
        PipelineError::Classification {
            frame_index,
            partial,
            error,
        } => {
            assert_eq!(frame_index, 30);
            assert_eq!(partial.timestamps()[0].to_string(), "0:00:00");
            assert!(matches!(error, ClassifierError::Status { status: 429, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}
