//! First-bytes protocol classification for the shared listening port.
//!
//! One TCP port carries three protocols: the binary game protocol, plain
//! HTTP and WebSocket upgrades. The classifier peeks at the first segment
//! without consuming it, so the game pipeline starts with the stream
//! untouched. The decision is made exactly once per connection, on that
//! connection's own task.

use crate::error::NetError;
use tokio::net::TcpStream;

/// Request-line prefixes that mark a connection as HTTP.
pub const HTTP_METHODS: [&str; 5] = ["GET ", "POST ", "DELETE ", "HEAD ", "PUT "];

/// How many leading bytes the classifier looks at.
const PEEK_LEN: usize = 512;

/// The pipeline a new connection is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Binary game protocol; no bytes were consumed.
    Game,
    /// Plain HTTP request.
    Http,
    /// HTTP GET on the WebSocket URI.
    WebSocket,
}

/// Classify a connection's leading bytes.
pub fn classify(head: &[u8], ws_uri: &str) -> ProtocolKind {
    let text = String::from_utf8_lossy(head);
    if let Some(rest) = text.strip_prefix("GET ") {
        if rest.starts_with(ws_uri) {
            return ProtocolKind::WebSocket;
        }
        return ProtocolKind::Http;
    }
    if HTTP_METHODS.iter().any(|m| text.starts_with(m)) {
        return ProtocolKind::Http;
    }
    ProtocolKind::Game
}

/// Extract the request path from an HTTP request line, if one is present.
pub fn request_path(head: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next()?;
    let mut parts = line.split(' ');
    let _method = parts.next()?;
    parts.next().map(str::to_string)
}

/// Peek the leading bytes of a stream without consuming them.
pub async fn peek_head(stream: &mut TcpStream) -> Result<Vec<u8>, NetError> {
    let mut buf = [0u8; PEEK_LEN];
    let n = stream.peek(&mut buf).await?;
    if n == 0 {
        return Err(NetError::ConnectionClosed);
    }
    Ok(buf[..n].to_vec())
}

/// Peek and classify in one step.
pub async fn sniff(stream: &mut TcpStream, ws_uri: &str) -> Result<ProtocolKind, NetError> {
    let head = peek_head(stream).await?;
    Ok(classify(&head, ws_uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn websocket_uri_get_is_websocket() {
        let head = b"GET /ws HTTP/1.1\r\nHost: example\r\n\r\n";
        assert_eq!(classify(head, "/ws"), ProtocolKind::WebSocket);
    }

    #[test]
    fn other_http_methods_are_http() {
        assert_eq!(
            classify(b"GET /status HTTP/1.1\r\n", "/ws"),
            ProtocolKind::Http
        );
        assert_eq!(
            classify(b"POST /api HTTP/1.1\r\n", "/ws"),
            ProtocolKind::Http
        );
        assert_eq!(
            classify(b"DELETE /thing HTTP/1.1\r\n", "/ws"),
            ProtocolKind::Http
        );
        assert_eq!(classify(b"HEAD / HTTP/1.1\r\n", "/ws"), ProtocolKind::Http);
        assert_eq!(classify(b"PUT /x HTTP/1.1\r\n", "/ws"), ProtocolKind::Http);
    }

    #[test]
    fn binary_frames_are_game_traffic() {
        // A frame header: 4-byte length, 4-byte code. Starts with NUL, which
        // no HTTP method does.
        let head = [0u8, 0, 0, 5, 0, 0, 0, 140, 1, 2, 3, 4, 5];
        assert_eq!(classify(&head, "/ws"), ProtocolKind::Game);
    }

    #[test]
    fn request_path_comes_from_the_request_line() {
        assert_eq!(
            request_path(b"GET /console HTTP/1.1\r\nHost: x\r\n"),
            Some("/console".to_string())
        );
        assert_eq!(request_path(b""), None);
    }

    #[tokio::test]
    async fn sniffing_consumes_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload: &[u8] = b"GET /ws HTTP/1.1\r\nHost: test\r\n\r\n";
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(payload).await.unwrap();
            stream
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let kind = sniff(&mut stream, "/ws").await.unwrap();
        assert_eq!(kind, ProtocolKind::WebSocket);

        // Every peeked byte is still readable afterwards.
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);

        drop(client.await.unwrap());
    }
}
