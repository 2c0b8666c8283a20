//! Binary API client (ports 8728, 8729 with TLS).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::DeviceConfig;
use crate::protocol::codec::{Reply, command_words, encode_sentence, read_sentence, parse_reply};
use crate::protocol::{ProtocolError, RouterClient, Row, tls};

/// Byte stream the API runs over: plain TCP or TLS.
pub trait ApiStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ApiStream for T {}

/// An authenticated sentence exchange over one stream.
pub struct ApiConnection<S> {
    stream: BufReader<S>,
}

impl<S: ApiStream> ApiConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send one command and read replies until `!done`.
    ///
    /// A `!trap` is remembered and the remaining replies are drained so the
    /// stream stays in sync; the trap is returned once `!done` arrives.
    pub async fn call(&mut self, words: &[String]) -> Result<(Vec<Row>, Row), ProtocolError> {
        let sentence = encode_sentence(words);
        self.stream.get_mut().write_all(&sentence).await?;
        self.stream.get_mut().flush().await?;

        let mut rows = Vec::new();
        let mut trap: Option<Row> = None;
        loop {
            match parse_reply(read_sentence(&mut self.stream).await?)? {
                Reply::Re(row) => rows.push(row),
                Reply::Trap(row) => {
                    trap.get_or_insert(row);
                }
                Reply::Fatal(message) => return Err(ProtocolError::Fatal(message)),
                Reply::Done(done) => {
                    if let Some(trap) = trap {
                        return Err(ProtocolError::Trap {
                            category: trap.get("category").and_then(|c| c.parse().ok()),
                            message: trap.get("message").cloned().unwrap_or_default(),
                        });
                    }
                    return Ok((rows, done));
                }
            }
        }
    }

    /// Log in with the post-6.43 plaintext method.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), ProtocolError> {
        let words = vec![
            "/login".to_string(),
            format!("=name={username}"),
            format!("=password={password}"),
        ];
        match self.call(&words).await {
            Ok((_, done)) if done.contains_key("ret") => Err(ProtocolError::Auth(
                "router requested legacy challenge login".to_string(),
            )),
            Ok(_) => Ok(()),
            Err(ProtocolError::Trap { message, .. }) => Err(ProtocolError::Auth(message)),
            Err(e) => Err(e),
        }
    }
}

/// RouterOS binary API client.
pub struct ApiClient {
    host: String,
    port: u16,
    username: String,
    password: String,
    use_ssl: bool,
    tls_verify: bool,
    connect_timeout: Duration,
    conn: Option<ApiConnection<Box<dyn ApiStream>>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("connected", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(device: &DeviceConfig, connect_timeout: Duration) -> Self {
        Self {
            host: device.host.clone(),
            port: device.effective_port(),
            username: device.username.clone(),
            password: device.password.clone(),
            use_ssl: device.use_ssl,
            tls_verify: device.tls_verify,
            connect_timeout,
            conn: None,
        }
    }

    fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_ssl: self.use_ssl,
            tls_verify: self.tls_verify,
        }
    }
}

/// Owned connection parameters, so the connect future does not borrow the client.
struct Target {
    host: String,
    port: u16,
    username: String,
    password: String,
    use_ssl: bool,
    tls_verify: bool,
}

impl Target {
    async fn open(self) -> Result<ApiConnection<Box<dyn ApiStream>>, ProtocolError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        let stream: Box<dyn ApiStream> = if self.use_ssl {
            Box::new(tls::connect(&self.host, tcp, self.tls_verify).await?)
        } else {
            Box::new(tcp)
        };

        let mut conn = ApiConnection::new(stream);
        conn.login(&self.username, &self.password).await?;
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl RouterClient for ApiClient {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.conn = None;
        let conn = timeout(self.connect_timeout, self.target().open())
            .await
            .map_err(|_| ProtocolError::Timeout(self.connect_timeout))??;
        tracing::debug!(host = %self.host, port = self.port, "API connection established");
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.stream.get_mut().shutdown().await;
            tracing::debug!(host = %self.host, "API connection closed");
        }
    }

    async fn run_command(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        deadline: Duration,
    ) -> Result<Vec<Row>, ProtocolError> {
        let conn = self.conn.as_mut().ok_or(ProtocolError::NotConnected)?;
        let words = command_words(path, params);

        let result = match timeout(deadline, conn.call(&words)).await {
            Ok(result) => result.map(|(rows, _)| rows),
            Err(_) => Err(ProtocolError::Timeout(deadline)),
        };

        // A timed-out exchange leaves unread replies on the wire
        if let Err(e) = &result
            && e.is_transport()
        {
            self.conn = None;
        }
        result
    }

    fn supports_rest(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    async fn send(server: &mut DuplexStream, words: &[&str]) {
        server.write_all(&encode_sentence(words)).await.unwrap();
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_connect_future_is_send() {
        let client = ApiClient::new(&DeviceConfig::new("r1", "10.0.0.1"), Duration::from_secs(1));
        assert_send(&client.target().open());
    }

    #[tokio::test]
    async fn test_call_collects_rows() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = ApiConnection::new(client);

        let router = tokio::spawn(async move {
            let cmd = read_sentence(&mut server).await.unwrap();
            assert_eq!(cmd, vec!["/interface/print"]);
            send(&mut server, &["!re", "=name=ether1", "=running=true"]).await;
            send(&mut server, &["!re", "=name=ether2", "=running=false"]).await;
            send(&mut server, &["!done"]).await;
            server
        });

        let (rows, _) = conn.call(&["/interface/print".to_string()]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "ether2");
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_trap_drains_to_done() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = ApiConnection::new(client);

        let router = tokio::spawn(async move {
            read_sentence(&mut server).await.unwrap();
            send(&mut server, &["!trap", "=category=0", "=message=no such command prefix"]).await;
            send(&mut server, &["!done"]).await;
            read_sentence(&mut server).await.unwrap();
            send(&mut server, &["!re", "=name=admin"]).await;
            send(&mut server, &["!done"]).await;
            server
        });

        let err = conn.call(&["/routing/bgp/session/print".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Trap { category: Some(0), ref message } if message == "no such command prefix"
        ));

        // The stream is still in sync for the next command
        let (rows, _) = conn.call(&["/user/print".to_string()]).await.unwrap();
        assert_eq!(rows[0]["name"], "admin");
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_variants() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = ApiConnection::new(client);

        let router = tokio::spawn(async move {
            let login = read_sentence(&mut server).await.unwrap();
            assert_eq!(login, vec!["/login", "=name=admin", "=password=secret"]);
            send(&mut server, &["!done"]).await;

            read_sentence(&mut server).await.unwrap();
            send(&mut server, &["!trap", "=message=invalid user name or password (6)"]).await;
            send(&mut server, &["!done"]).await;

            read_sentence(&mut server).await.unwrap();
            send(&mut server, &["!done", "=ret=0123456789abcdef"]).await;
            server
        });

        conn.login("admin", "secret").await.unwrap();
        assert!(matches!(
            conn.login("admin", "wrong").await,
            Err(ProtocolError::Auth(m)) if m.contains("invalid user name")
        ));
        assert!(matches!(
            conn.login("admin", "secret").await,
            Err(ProtocolError::Auth(m)) if m.contains("legacy")
        ));
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_is_transport() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = ApiConnection::new(client);
        send(&mut server, &["!fatal", "session terminated on request"]).await;

        let err = conn.call(&["/quit".to_string()]).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_run_command_requires_connection() {
        let device = DeviceConfig::new("r1", "192.0.2.1");
        let mut client = ApiClient::new(&device, Duration::from_millis(100));
        assert!(!client.is_connected());
        assert!(!client.supports_rest());
        assert!(matches!(
            client
                .run_command("/system/resource/print", &[], Duration::from_secs(1))
                .await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let device = DeviceConfig::new("r1", "127.0.0.1").with_port(port);
        let mut client = ApiClient::new(&device, Duration::from_secs(2));
        let err = client.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert!(!client.is_connected());
    }
}
