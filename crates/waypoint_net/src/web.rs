//! Plain-HTTP and WebSocket service for sniffed connections.
//!
//! Connections classified away from the game protocol land here with their
//! bytes still unread (the sniffer only peeks). HTTP requests are aggregated
//! up to a cap, dispatched against registered GET/POST routes and answered
//! with `Connection: close`. WebSocket upgrades are handed to a registered
//! [`WebSocketService`] and pumped until close, error or read idle.

use crate::error::NetError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, warn};

/// Largest HTTP request (head plus body) we will aggregate.
pub const HTTP_AGGREGATE_LIMIT: usize = 1_048_576;

/// A socket that upgrades but then never talks gets dropped.
const WS_READ_IDLE: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 4096;

/// One parsed HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The uri with any query string stripped.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::with_status(200, body)
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(404, "not found")
    }

    pub fn with_status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "",
        };
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason,
            self.content_type,
            self.body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Handles inbound text messages on one upgraded socket. Replies go through
/// the `outbound` sender and are written by the connection's pump loop.
#[async_trait]
pub trait WebSocketService: Send + Sync {
    async fn handle(&self, outbound: &mpsc::UnboundedSender<String>, message: &str);
}

type HttpHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Route tables shared by every acceptor.
pub struct WebRoutes {
    get_routes: DashMap<String, HttpHandler>,
    post_routes: DashMap<String, HttpHandler>,
    ws_routes: DashMap<String, Arc<dyn WebSocketService>>,
    ws_uri: String,
}

impl WebRoutes {
    pub fn new(ws_uri: impl Into<String>) -> Self {
        Self {
            get_routes: DashMap::new(),
            post_routes: DashMap::new(),
            ws_routes: DashMap::new(),
            ws_uri: ws_uri.into(),
        }
    }

    /// Uri prefix the sniffer treats as a WebSocket upgrade.
    pub fn ws_uri(&self) -> &str {
        &self.ws_uri
    }

    pub fn get(
        &self,
        path: impl Into<String>,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.get_routes.insert(path.into(), Arc::new(handler));
    }

    pub fn post(
        &self,
        path: impl Into<String>,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.post_routes.insert(path.into(), Arc::new(handler));
    }

    pub fn websocket(&self, path: impl Into<String>, service: Arc<dyn WebSocketService>) {
        self.ws_routes.insert(path.into(), service);
    }

    /// Serve one HTTP exchange and close the socket.
    pub async fn serve_http(&self, mut stream: TcpStream) -> Result<(), NetError> {
        let response = match self.read_request(&mut stream).await {
            Ok(request) => self.dispatch(&request),
            Err(NetError::FrameTooLarge { .. }) => {
                HttpResponse::with_status(413, "payload too large")
            }
            Err(e) => return Err(e),
        };
        stream.write_all(&response.into_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn read_request(&self, stream: &mut TcpStream) -> Result<HttpRequest, NetError> {
        let (mut buf, header_end) = read_head(stream).await?;
        let (method, uri, headers) =
            parse_request(&buf[..header_end]).ok_or(NetError::IncompleteFrame)?;

        let content_length = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > HTTP_AGGREGATE_LIMIT {
            return Err(NetError::FrameTooLarge {
                length: content_length,
                max: HTTP_AGGREGATE_LIMIT,
            });
        }

        let mut body = buf.split_off(header_end);
        while body.len() < content_length {
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(NetError::IncompleteFrame);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);

        Ok(HttpRequest {
            method,
            uri,
            headers,
            body,
        })
    }

    fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        let path = request.path();
        let handler = match request.method.as_str() {
            "GET" => self.get_routes.get(path).map(|h| h.value().clone()),
            "POST" => self.post_routes.get(path).map(|h| h.value().clone()),
            _ => return HttpResponse::with_status(405, "method not allowed"),
        };
        match handler {
            Some(handler) => handler(request),
            None => HttpResponse::not_found(),
        }
    }

    /// Upgrade `stream` and pump the service registered at `path`. Sockets
    /// with no registered service are dropped without a handshake.
    pub async fn serve_websocket(&self, stream: TcpStream, path: &str) -> Result<(), NetError> {
        let service = match self.ws_routes.get(path).map(|s| s.value().clone()) {
            Some(service) => service,
            None => {
                debug!("no websocket service registered at {}", path);
                return Ok(());
            }
        };

        let ws_stream = accept_async(stream).await.map_err(ws_error)?;
        let (mut sink, mut source) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        loop {
            tokio::select! {
                reply = outbound_rx.recv() => {
                    match reply {
                        Some(text) => {
                            if sink.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = timeout(WS_READ_IDLE, source.next()) => {
                    match inbound {
                        Err(_) => {
                            warn!("websocket at {} idle for {:?}, closing", path, WS_READ_IDLE);
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Ok(Message::Text(text)))) => {
                            service.handle(&outbound_tx, text.as_str()).await;
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Ok(Message::Close(_)))) => break,
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            debug!("websocket error at {}: {}", path, e);
                            break;
                        }
                    }
                }
            }
        }
        let _ = sink.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for WebRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRoutes")
            .field("get_routes", &self.get_routes.len())
            .field("post_routes", &self.post_routes.len())
            .field("ws_routes", &self.ws_routes.len())
            .field("ws_uri", &self.ws_uri)
            .finish()
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, usize), NetError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(end) = find_header_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > HTTP_AGGREGATE_LIMIT {
            return Err(NetError::FrameTooLarge {
                length: buf.len(),
                max: HTTP_AGGREGATE_LIMIT,
            });
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NetError::IncompleteFrame);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_request(head: &[u8]) -> Option<(String, String, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((method, uri, headers))
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> NetError {
    match e {
        tokio_tungstenite::tungstenite::Error::Io(io) => NetError::Io(io),
        other => NetError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn request_line_and_headers_parse() {
        let head = b"GET /status?verbose=1 HTTP/1.1\r\nHost: relay\r\nContent-Length: 0\r\n\r\n";
        let end = find_header_end(head).unwrap();
        assert_eq!(end, head.len());

        let (method, uri, headers) = parse_request(&head[..end]).unwrap();
        let request = HttpRequest {
            method,
            uri,
            headers,
            body: Vec::new(),
        };
        assert_eq!(request.method, "GET");
        assert_eq!(request.path(), "/status");
        assert_eq!(request.header("host"), Some("relay"));
        assert_eq!(request.header("CONTENT-LENGTH"), Some("0"));
        assert_eq!(request.header("x-missing"), None);
    }

    #[test]
    fn responses_always_close_the_connection() {
        let bytes = HttpResponse::ok("hello").into_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    async fn paired_streams() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn read_to_end(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_routes_dispatch_and_miss() {
        let routes = Arc::new(WebRoutes::new("/ws"));
        routes.get("/status", |_| HttpResponse::ok("up"));

        let (mut client, server) = paired_streams().await;
        let served = routes.clone();
        let task = tokio::spawn(async move { served.serve_http(server).await });

        client
            .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let reply = read_to_end(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.ends_with("up"));
        task.await.unwrap().unwrap();

        let (mut client, server) = paired_streams().await;
        let served = routes.clone();
        tokio::spawn(async move { served.serve_http(server).await });
        client
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let reply = read_to_end(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn post_bodies_reach_the_handler() {
        let routes = Arc::new(WebRoutes::new("/ws"));
        routes.post("/echo", |request| {
            HttpResponse::ok(format!("got:{}", request.body_text()))
        });

        let (mut client, server) = paired_streams().await;
        let served = routes.clone();
        tokio::spawn(async move { served.serve_http(server).await });

        client
            .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        let reply = read_to_end(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.ends_with("got:hello"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbounded_heads_are_refused() {
        let routes = Arc::new(WebRoutes::new("/ws"));
        let (mut client, server) = paired_streams().await;
        let served = routes.clone();
        tokio::spawn(async move { served.serve_http(server).await });

        // Never sends the blank line that would end the headers.
        let junk = vec![b'a'; HTTP_AGGREGATE_LIMIT + READ_CHUNK];
        let _ = client.write_all(b"GET /x HTTP/1.1\r\n").await;
        let _ = client.write_all(&junk).await;
        let reply = read_to_end(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 413"));
    }

    struct EchoService;

    #[async_trait]
    impl WebSocketService for EchoService {
        async fn handle(&self, outbound: &mpsc::UnboundedSender<String>, message: &str) {
            let _ = outbound.send(format!("echo:{}", message));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn websocket_service_round_trips() {
        let routes = Arc::new(WebRoutes::new("/ws"));
        routes.websocket("/ws", Arc::new(EchoService));

        let (client, server) = paired_streams().await;
        let served = routes.clone();
        tokio::spawn(async move { served.serve_websocket(server, "/ws").await });

        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/ws", client)
            .await
            .unwrap();
        let (mut sink, mut source) = ws.split();
        sink.send(Message::text("ping")).await.unwrap();

        let reply = source.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), "echo:ping");

        sink.close().await.unwrap();
    }
}
