use keel::workflows::http::HttpWorkflow;
use keel::workflows::{WorkflowContext, WorkflowHandler};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn ctx() -> WorkflowContext {
    WorkflowContext {
        workflow_id: "http-test".to_string(),
        task_queue: "q".to_string(),
        attempt: 1,
    }
}

// Answers a single request with a canned response and returns the server's URL.
async fn serve_once(status_line: &'static str, content_type: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];
        // read the headers, then as much body as Content-Length announces
        loop {
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + content_length {
                    break;
                }
            }
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            content_type,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    format!("http://{}/", addr)
}

#[tokio::test]
async fn test_http_workflow_parses_json_body() {
    let url = serve_once("200 OK", "application/json", r#"{"greeting":"hi","n":[1,2]}"#).await;

    let result = HttpWorkflow::new()
        .execute(vec![json!({ "url": url })], &ctx())
        .await
        .expect("request failed");

    assert_eq!(result["status"], json!(200));
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["data"], json!({"greeting": "hi", "n": [1, 2]}));
}

#[tokio::test]
async fn test_http_workflow_keeps_text_body_and_error_status() {
    let url = serve_once("503 Service Unavailable", "text/plain", "try again later").await;

    let result = HttpWorkflow::new()
        .execute(
            vec![json!({ "url": url, "method": "post", "body": {"k": "v"}, "headers": {"x-trace": "abc"} })],
            &ctx(),
        )
        .await
        .expect("a non-2xx status is still a result");

    assert_eq!(result["status"], json!(503));
    assert_eq!(result["ok"], json!(false));
    assert_eq!(result["data"], json!("try again later"));
}

#[tokio::test]
async fn test_http_workflow_rejects_bad_requests() {
    let http = HttpWorkflow::new();
    assert!(http.execute(vec![], &ctx()).await.is_err());
    assert!(http.execute(vec![json!({"method": "GET"})], &ctx()).await.is_err());
    assert!(
        http.execute(vec![json!({"url": "http://127.0.0.1:1/", "method": "NOT A METHOD"})], &ctx())
            .await
            .is_err()
    );
}

#[tokio::test]
#[ignore] // needs network access
async fn test_http_workflow_get() {
    let result = HttpWorkflow::new()
        .execute(vec![json!({"url": "https://httpbin.org/get", "method": "GET", "timeout_ms": 10000})], &ctx())
        .await
        .expect("request failed");

    println!("Response: {}", result);
    assert_eq!(result["status"], json!(200));
    assert!(result["data"].is_object());
}
