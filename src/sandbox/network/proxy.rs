//! Local HTTP/HTTPS proxy that wrapped commands are pointed at.
//!
//! Supports `CONNECT host:port` tunnels and absolute-form plain HTTP
//! requests. Each accepted connection runs in its own task and loads the
//! network snapshot once.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NetworkEnforcer, Verdict};
use crate::sandbox::error::{Result, SandboxError};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
X-Proxy-Error: blocked-by-allowlist\r\n\
Content-Type: text/plain\r\n\
Content-Length: 38\r\n\
Connection: close\r\n\
\r\n\
Connection blocked by sandbox policy.\n";

const BAD_GATEWAY_RESPONSE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\
\r\n";

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\
\r\n";

/// Running proxy listener.
#[derive(Debug)]
pub struct ProxyHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the accept loop to exit. Established
    /// tunnels are cancelled as well.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }
    }
}

/// Bind `127.0.0.1:0` and start serving.
pub async fn start(enforcer: Arc<NetworkEnforcer>) -> Result<ProxyHandle> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(SandboxError::ProxyStart)?;
    let addr = listener.local_addr().map_err(SandboxError::ProxyStart)?;
    let cancel = CancellationToken::new();

    info!("Network proxy listening on {}", addr);

    let task = tokio::spawn(accept_loop(listener, enforcer, cancel.clone()));
    Ok(ProxyHandle { addr, cancel, task })
}

async fn accept_loop(
    listener: TcpListener,
    enforcer: Arc<NetworkEnforcer>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let enforcer = enforcer.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = handle_connection(stream, enforcer) => {
                                if let Err(e) = result {
                                    debug!(%peer, "proxy connection ended: {}", e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Proxy accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("Network proxy stopped");
}

/// Parsed request head.
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.split("\r\n");
        let mut parts = lines.next()?.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Some(Self {
            method,
            target,
            version,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Attribution token: the user part of `Proxy-Authorization: Basic`.
    fn token(&self) -> Option<String> {
        let value = self.header("Proxy-Authorization")?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let user = decoded.split(':').next().unwrap_or_default();
        (!user.is_empty()).then(|| user.to_string())
    }

    /// Destination host, port, and for plain HTTP the origin-form path.
    fn destination(&self) -> Option<(String, u16, Option<String>)> {
        if self.is_connect() {
            let (host, port) = split_host_port(&self.target, 443)?;
            return Some((host, port, None));
        }

        if let Some(rest) = self.target.strip_prefix("http://") {
            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], rest[i..].to_string()),
                None => (rest, "/".to_string()),
            };
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let (host, port) = split_host_port(authority, 80)?;
            return Some((host, port, Some(path)));
        }

        // Origin-form request sent straight to the proxy; fall back to Host.
        let (host, port) = split_host_port(self.header("Host")?, 80)?;
        Some((host, port, Some(self.target.clone())))
    }

    /// Origin-form head for the upstream server, minus proxy headers.
    fn origin_form(&self, path: &str) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if lower.starts_with("proxy-") || lower == "connection" || lower == "keep-alive" {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("Connection: close\r\n\r\n");
        out
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => Some((authority.to_string(), default_port)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Read up to and including the blank line that ends the request head.
async fn read_head<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let before = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Ok(None);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Ok(None);
        }
        let line = &head[before..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(Some(String::from_utf8_lossy(&head).into_owned()))
}

async fn handle_connection(stream: TcpStream, enforcer: Arc<NetworkEnforcer>) -> std::io::Result<()> {
    let mut client = BufReader::new(stream);

    let Some(raw) = read_head(&mut client).await? else {
        return Ok(());
    };
    let Some(head) = RequestHead::parse(&raw) else {
        client.get_mut().write_all(BAD_REQUEST_RESPONSE).await?;
        return Ok(());
    };
    let Some((host, port, path)) = head.destination() else {
        client.get_mut().write_all(BAD_REQUEST_RESPONSE).await?;
        return Ok(());
    };

    let task = head.token().and_then(|t| enforcer.lookup_token(&t));

    if enforcer.decide(&host, port, task.as_ref()).await == Verdict::Deny {
        debug!(host = %host, port, "proxy denied connection");
        client.get_mut().write_all(FORBIDDEN_RESPONSE).await?;
        return Ok(());
    }

    let upstream = match tokio::time::timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(host = %host, port, "upstream connect failed: {}", e);
            client.get_mut().write_all(BAD_GATEWAY_RESPONSE).await?;
            return Ok(());
        }
        Err(_) => {
            debug!(host = %host, port, "upstream connect timed out");
            client.get_mut().write_all(BAD_GATEWAY_RESPONSE).await?;
            return Ok(());
        }
    };

    tunnel(client, upstream, &head, path.as_deref()).await
}

async fn tunnel<S>(
    mut client: BufReader<S>,
    mut upstream: TcpStream,
    head: &RequestHead,
    path: Option<&str>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match path {
        None => {
            client
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
        }
        Some(path) => {
            upstream.write_all(head.origin_form(path).as_bytes()).await?;
        }
    }

    // Bytes the client pipelined behind the head are still in the buffer.
    let buffered = client.buffer().to_vec();
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
    }

    let mut client = client.into_inner();
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::network::NetworkState;
    use crate::sandbox::policy::{NetworkMode, NetworkPolicy};
    use crate::sandbox::violations::{ViolationKind, ViolationStore};
    use tokio::io::AsyncReadExt;

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw).unwrap()
    }

    #[test]
    fn test_connect_destination() {
        let head = head("CONNECT api.github.com:443 HTTP/1.1\r\nHost: api.github.com:443\r\n\r\n");
        assert!(head.is_connect());
        assert_eq!(
            head.destination(),
            Some(("api.github.com".to_string(), 443, None))
        );
    }

    #[test]
    fn test_absolute_form_destination_and_rewrite() {
        let head = head(
            "GET http://example.com:8080/index.html?q=1 HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             Proxy-Authorization: Basic dG9rZW46eA==\r\n\
             Proxy-Connection: keep-alive\r\n\
             Accept: */*\r\n\r\n",
        );
        let (host, port, path) = head.destination().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path.as_deref(), Some("/index.html?q=1"));

        let rewritten = head.origin_form("/index.html?q=1");
        assert!(rewritten.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(rewritten.contains("Accept: */*\r\n"));
        assert!(!rewritten.to_ascii_lowercase().contains("proxy-"));
        assert!(rewritten.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_token_from_basic_auth() {
        // "token:x"
        let head = head("CONNECT a.com:443 HTTP/1.1\r\nProxy-Authorization: Basic dG9rZW46eA==\r\n\r\n");
        assert_eq!(head.token().as_deref(), Some("token"));

        let head = RequestHead::parse("CONNECT a.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.token(), None);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.com", 80), Some(("a.com".into(), 80)));
        assert_eq!(split_host_port("a.com:8443", 80), Some(("a.com".into(), 8443)));
        assert_eq!(split_host_port("[::1]:9000", 80), Some(("::1".into(), 9000)));
        assert_eq!(split_host_port("a.com:notaport", 80), None);
        assert_eq!(split_host_port("", 80), None);
    }

    async fn proxy_with(mode: NetworkMode, allowed: &[&str]) -> (Arc<NetworkEnforcer>, ProxyHandle) {
        let enforcer = Arc::new(NetworkEnforcer::new(Arc::new(ViolationStore::default())));
        let policy = NetworkPolicy {
            mode,
            allowed_hosts: allowed.iter().map(|s| s.to_string()).collect(),
            denied_hosts: Vec::new(),
            ask_timeout: Duration::from_secs(1),
            ask_callback: None,
        };
        enforcer.install(NetworkState::new(1, &policy, CancellationToken::new()));
        let handle = start(enforcer.clone()).await.unwrap();
        (enforcer, handle)
    }

    #[tokio::test]
    async fn test_denied_connect_gets_403_and_violation() {
        let (enforcer, proxy) = proxy_with(NetworkMode::AllowList, &["example.com"]).await;
        let token = enforcer.register_task("task-7", Some("curl https://other.com"));
        let auth = STANDARD.encode(format!("{}:x", token));

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        client
            .write_all(
                format!(
                    "CONNECT other.com:443 HTTP/1.1\r\nHost: other.com:443\r\nProxy-Authorization: Basic {}\r\n\r\n",
                    auth
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(response.contains("X-Proxy-Error: blocked-by-allowlist"));

        let violations = enforcer.violations().list(Some("task-7"));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Network);
        assert_eq!(violations[0].resource, "other.com");

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_allowed_connect_tunnels_bytes() {
        let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (_enforcer, proxy) = proxy_with(NetworkMode::AllowList, &["127.0.0.1"]).await;

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes())
            .await
            .unwrap();

        let mut reader = BufReader::new(client);
        let mut status = String::new();
        reader.read_line(&mut status).await.unwrap();
        assert!(status.starts_with("HTTP/1.1 200"));
        let mut blank = String::new();
        reader.read_line(&mut blank).await.unwrap();

        let mut client = reader.into_inner();
        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let (_enforcer, proxy) = proxy_with(NetworkMode::DenyList, &[]).await;
        let addr = proxy.addr();
        proxy.shutdown().await;

        // The listener socket is dropped with the accept loop.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
