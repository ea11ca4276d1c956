use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use futures_util::StreamExt;
use opencode_api::{ApiConfig, ApiError, OpencodeClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
enum ScriptedResponse {
    Respond {
        status: u16,
        content_type: &'static str,
        chunks: Vec<ResponseChunk>,
    },
    Reset,
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    request_lines: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_lines = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let request_lines = Arc::clone(&request_lines);

            async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let request_lines = Arc::clone(&request_lines);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, request_lines).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            request_lines,
            handle,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn request_lines(&self) -> Vec<String> {
        self.request_lines.lock().expect("request lines lock").clone()
    }

    fn client(&self) -> OpencodeClient {
        OpencodeClient::new(ApiConfig::new(&self.base_url)).expect("client")
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn response_json(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "application/json",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn sse_frames(frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();

    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }

    body.into_bytes()
}

#[tokio::test]
async fn list_sessions_decodes_server_order() {
    let server = ScriptedServer::new(vec![response_json(
        200,
        r#"[{"id":"a","title":"A","time":{"created":1,"updated":100}},{"id":"b","title":"B","time":{"created":1,"updated":300}}]"#,
    )])
    .await;

    let sessions = server
        .client()
        .list_sessions()
        .await
        .expect("list should succeed");

    assert_eq!(
        sessions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(server.request_lines(), vec!["GET /session HTTP/1.1"]);
    server.shutdown();
}

#[tokio::test]
async fn session_messages_requests_session_path() {
    let server = ScriptedServer::new(vec![response_json(
        200,
        r#"[{"info":{"id":"m1","sessionID":"s1","role":"user","time":{"created":1}},"parts":[{"id":"p1","sessionID":"s1","messageID":"m1","type":"text","text":"hi"}]}]"#,
    )])
    .await;

    let messages = server
        .client()
        .session_messages("s1")
        .await
        .expect("messages should load");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].info.id, "m1");
    assert_eq!(messages[0].parts[0].id, "p1");
    assert_eq!(
        server.request_lines(),
        vec!["GET /session/s1/message HTTP/1.1"]
    );
    server.shutdown();
}

#[tokio::test]
async fn retryable_status_then_success() {
    let server = ScriptedServer::new(vec![
        response_json(503, r#"{"message":"overloaded"}"#),
        response_json(200, "[]"),
    ])
    .await;

    let sessions = timeout(Duration::from_secs(5), server.client().list_sessions())
        .await
        .expect("retry path should be bounded")
        .expect("list should eventually succeed");

    assert!(sessions.is_empty());
    assert_eq!(server.request_count(), 2);
    server.shutdown();
}

#[tokio::test]
async fn non_retryable_status_fails_with_server_message() {
    let server = ScriptedServer::new(vec![response_json(
        404,
        r#"{"name":"NotFoundError","data":{"message":"session not found"}}"#,
    )])
    .await;

    let error = server
        .client()
        .session_messages("missing")
        .await
        .expect_err("404 must fail");

    assert!(
        matches!(&error, ApiError::Status(code, message) if code.as_u16() == 404 && message == "session not found"),
        "unexpected error: {error}"
    );
    assert_eq!(server.request_count(), 1);
    server.shutdown();
}

#[tokio::test]
async fn connection_reset_exhausts_retries() {
    let server = ScriptedServer::new(vec![
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
    ])
    .await;

    let error = timeout(Duration::from_secs(10), server.client().list_sessions())
        .await
        .expect("retry path should resolve")
        .expect_err("connection reset should surface as failure");

    assert!(matches!(error, ApiError::RetryExhausted { status: None, .. }));
    assert!(error.is_connect());
    assert_eq!(server.request_count(), 3);
    server.shutdown();
}

#[tokio::test]
async fn event_stream_yields_envelopes_across_chunks() {
    let server = ScriptedServer::new(vec![ScriptedResponse::Respond {
        status: 200,
        content_type: "text/event-stream",
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: sse_frames(&[
                    r#"{"type":"server.connected","properties":{}}"#,
                    r#"{"type":"message.updated","properties":{"info":{"id":"m1","sessionID":"s1","role":"assistant","time":{"created":1}}}}"#,
                ]),
            },
            ResponseChunk {
                delay_ms: 20,
                bytes: b"data: {\"type\":\"message.removed\",".to_vec(),
            },
            ResponseChunk {
                delay_ms: 20,
                bytes: b"\"properties\":{\"sessionID\":\"s1\",\"messageID\":\"m1\"}}\n\n".to_vec(),
            },
        ],
    }])
    .await;

    let client = server.client();
    let mut stream = client
        .subscribe_events(None)
        .await
        .expect("stream should open");

    let mut types = Vec::new();
    while let Some(item) = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream should make progress")
    {
        let envelope = item.expect("frames should decode");
        types.push(envelope.event_type.unwrap_or_default());
    }

    assert_eq!(
        types,
        vec!["server.connected", "message.updated", "message.removed"]
    );
    assert_eq!(server.request_lines(), vec!["GET /event HTTP/1.1"]);
    server.shutdown();
}

#[tokio::test]
async fn event_stream_open_is_not_retried() {
    let server = ScriptedServer::new(vec![response_json(503, r#"{"message":"overloaded"}"#)]).await;

    let error = match server.client().subscribe_events(None).await {
        Ok(_) => panic!("503 must fail the subscription"),
        Err(error) => error,
    };

    assert!(matches!(error, ApiError::Status(code, _) if code.as_u16() == 503));
    assert_eq!(server.request_count(), 1);
    server.shutdown();
}

#[tokio::test]
async fn cancelled_open_returns_cancelled() {
    let server = ScriptedServer::new(vec![ScriptedResponse::Respond {
        status: 200,
        content_type: "text/event-stream",
        chunks: vec![ResponseChunk {
            delay_ms: 500,
            bytes: sse_frames(&[r#"{"type":"session.updated","properties":{}}"#]),
        }],
    }])
    .await;

    let client = server.client();
    let cancellation = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn({
        let cancellation = Arc::clone(&cancellation);
        async move {
            let mut stream = client.subscribe_events(Some(&cancellation)).await?;
            opencode_api::await_or_cancel(stream.next(), Some(&cancellation)).await?;
            Ok::<(), ApiError>(())
        }
    });

    sleep(Duration::from_millis(100)).await;
    cancellation.store(true, Ordering::Release);

    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("task should resolve")
        .expect("join should succeed");
    assert!(matches!(result, Err(ApiError::Cancelled)));
    server.shutdown();
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    request_lines: Arc<Mutex<Vec<String>>>,
) {
    let request_line = match read_request_line(&mut socket).await {
        Ok(Some(line)) => line,
        _ => return,
    };

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    request_lines
        .lock()
        .expect("request lines lock")
        .push(request_line);
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| response_json(500, r#"{"message":"unexpected request"}"#));

    match response {
        ScriptedResponse::Reset => {}
        ScriptedResponse::Respond {
            status,
            content_type,
            chunks,
        } => {
            let headers = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                status_reason(status),
                content_type,
            );

            if socket.write_all(headers.as_bytes()).await.is_err() {
                return;
            }

            for chunk in chunks {
                if chunk.delay_ms > 0 {
                    sleep(Duration::from_millis(chunk.delay_ms)).await;
                }
                let prefix = format!("{:X}\r\n", chunk.bytes.len());
                if socket.write_all(prefix.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(&chunk.bytes).await.is_err() {
                    return;
                }
                if socket.write_all(b"\r\n").await.is_err() {
                    return;
                }
            }

            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request_line(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];

    loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        request.extend_from_slice(&buffer[..n]);
        if request.windows(4).any(|window| window == b"\r\n\r\n") {
            let text = String::from_utf8_lossy(&request);
            return Ok(text.lines().next().map(ToString::to_string));
        }
    }
}
