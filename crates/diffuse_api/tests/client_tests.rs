//! Integration tests for the HTTP client.
//!
//! Each test serves one canned HTTP response from a local socket.

use std::time::Duration;

use diffuse_api::{ApiError, GenerationBackend, GenerationRequest, WebUiClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve a single response and hand back the raw request text.
async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        request
    });

    (base_url, handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn client() -> WebUiClient {
    WebUiClient::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_txt2img_posts_payload_and_returns_images() {
    let (base_url, server) = serve_once("200 OK", r#"{"images": ["aGVsbG8="], "info": "{}"}"#).await;
    let payload = GenerationRequest::new("a red fox").size(512.0, 512.0).to_payload();

    let images = client().txt2img(&base_url, &payload).await.unwrap();
    assert_eq!(images, vec!["aGVsbG8=".to_string()]);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /sdapi/v1/txt2img HTTP/1.1"));
    assert!(request.contains("\"prompt\":\"a red fox\""));
    assert!(request.contains("\"width\":512"));
    assert!(request.contains("\"seed\":-1"));
}

#[tokio::test]
async fn test_txt2img_empty_images() {
    let (base_url, _server) = serve_once("200 OK", r#"{"images": []}"#).await;
    let payload = GenerationRequest::new("x").to_payload();

    let err = client().txt2img(&base_url, &payload).await.unwrap_err();
    assert_eq!(err, ApiError::EmptyResult);
}

#[tokio::test]
async fn test_txt2img_malformed_body() {
    let (base_url, _server) = serve_once("200 OK", "not json").await;
    let payload = GenerationRequest::new("x").to_payload();

    let err = client().txt2img(&base_url, &payload).await.unwrap_err();
    assert_eq!(err.kind(), "decode");
}

#[tokio::test]
async fn test_txt2img_http_error() {
    let (base_url, _server) = serve_once("500 Internal Server Error", r#"{"error": "OOM"}"#).await;
    let payload = GenerationRequest::new("x").to_payload();

    match client().txt2img(&base_url, &payload).await.unwrap_err() {
        ApiError::Status { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("OOM"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_txt2img_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let payload = GenerationRequest::new("x").to_payload();
    let err = client().txt2img(&base_url, &payload).await.unwrap_err();
    assert_eq!(err.kind(), "network");
}

#[tokio::test]
async fn test_txt2img_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let _server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = WebUiClient::new(Duration::from_millis(200)).unwrap();
    let payload = GenerationRequest::new("x").to_payload();
    let err = client.txt2img(&base_url, &payload).await.unwrap_err();
    assert_eq!(err, ApiError::Timeout);
}

#[tokio::test]
async fn test_progress_and_checkpoint() {
    let (base_url, server) = serve_once("200 OK", r#"{"progress": 0.42, "eta_relative": 3.1}"#).await;
    let progress = client().progress(&base_url).await.unwrap();
    assert!((progress - 0.42).abs() < f64::EPSILON);
    assert!(server.await.unwrap().starts_with("GET /sdapi/v1/progress"));

    let (base_url, server) = serve_once("200 OK", "null").await;
    client()
        .set_checkpoint(&base_url, "v1-5-pruned-emaonly.safetensors")
        .await
        .unwrap();
    let request = server.await.unwrap();
    assert!(request.starts_with("POST /sdapi/v1/options"));
    assert!(request.contains("\"sd_model_checkpoint\":\"v1-5-pruned-emaonly.safetensors\""));
}
