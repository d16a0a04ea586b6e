//! Test helpers shared across modules.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Local HTTP stub that answers canned responses in order and records each
/// request it received.
pub(crate) struct StubServer {
    pub(crate) base: String,
    requests: UnboundedReceiver<String>,
}

impl StubServer {
    /// Next raw request (request line, headers and body).
    pub(crate) async fn next_request(&mut self) -> String {
        self.requests.recv().await.expect("stub server closed")
    }
}

/// Serves `responses` one connection each, then stops accepting.
pub(crate) async fn serve_sequence(responses: Vec<(&'static str, String)>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, requests) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for (status_line, body) in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    StubServer {
        base: format!("http://{addr}"),
        requests,
    }
}

/// Serves a single canned HTTP response on an ephemeral port and returns
/// `http://addr`.
pub(crate) async fn serve_once(status_line: &'static str, body: &'static str) -> String {
    serve_sequence(vec![(status_line, body.to_string())]).await.base
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        received.extend_from_slice(&chunk[..n]);
        let Some(header_end) = find(&received, b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&received[..header_end]).to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if received.len() >= header_end + 4 + content_length {
            break;
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
