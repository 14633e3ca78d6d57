//! TCP transport with optional TLS, built on tokio and native-tls.
//!
//! The trust anchor is installed once when the transport is built; every
//! later (re)connection reuses the same connector.

use super::TransportError;
use crate::core::Transport;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsStream;
use url::{Host, Url};

/// Whether the endpoint is reached in clear text or over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where the messaging endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses an API base URL such as `https://api.telegram.org` or
    /// `http://127.0.0.1:8081`. Any path component is ignored.
    pub fn parse(url: &str) -> Result<Self, String> {
        let parsed = Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
        let scheme = match parsed.scheme() {
            "https" => Scheme::Https,
            "http" => Scheme::Http,
            other => {
                return Err(format!(
                    "unsupported scheme '{}' in '{}', expected http or https",
                    other, url
                ))
            }
        };
        let host = match parsed.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(format!("missing host in '{}'", url)),
        };
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    /// Host with IPv6 literals in brackets, as it appears in a URL.
    fn authority_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// The value of the HTTP `Host` header for this endpoint.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.authority_host()
        } else {
            format!("{}:{}", self.authority_host(), self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{}://{}:{}", scheme, self.authority_host(), self.port)
    }
}

/// The root certificate configuration used to verify the endpoint.
#[derive(Clone, Default)]
pub struct TlsTrust {
    root_pem: Option<Vec<u8>>,
    only_custom_roots: bool,
}

impl TlsTrust {
    /// Trusts the platform's built-in root store.
    pub fn system() -> Self {
        Self::default()
    }

    /// Adds a PEM encoded root certificate. When `only_custom_roots` is set
    /// the platform roots are disabled and the certificate acts as a pin.
    pub fn from_pem(pem: Vec<u8>, only_custom_roots: bool) -> Self {
        Self {
            root_pem: Some(pem),
            only_custom_roots,
        }
    }

    pub fn from_pem_file(path: &Path, only_custom_roots: bool) -> Result<Self, TransportError> {
        let pem = std::fs::read(path)?;
        Ok(Self::from_pem(pem, only_custom_roots))
    }

    fn connector(&self) -> Result<tokio_native_tls::TlsConnector, TransportError> {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(pem) = &self.root_pem {
            let cert = native_tls::Certificate::from_pem(pem)
                .map_err(|e| TransportError::Tls(format!("invalid root certificate: {}", e)))?;
            builder.add_root_certificate(cert);
            builder.disable_built_in_roots(self.only_custom_roots);
        }
        let connector = builder
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(tokio_native_tls::TlsConnector::from(connector))
    }
}

impl fmt::Debug for TlsTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTrust")
            .field("custom_root", &self.root_pem.is_some())
            .field("only_custom_roots", &self.only_custom_roots)
            .finish()
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A `Transport` over a real socket.
pub struct NetTransport {
    endpoint: Endpoint,
    connector: Option<tokio_native_tls::TlsConnector>,
    connect_timeout: Duration,
    stream: Option<Stream>,
}

impl NetTransport {
    /// Builds a transport for `endpoint`. For `https` endpoints the TLS
    /// connector is created here, so certificate problems surface at
    /// startup rather than on the first send.
    pub fn new(
        endpoint: Endpoint,
        trust: &TlsTrust,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let connector = match endpoint.scheme {
            Scheme::Https => Some(trust.connector()?),
            Scheme::Http => None,
        };
        Ok(Self {
            endpoint,
            connector,
            connect_timeout,
            stream: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Stream, TransportError> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let tcp = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::TimedOut)?
            .map_err(|e| TransportError::Connect {
                host: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        match &self.connector {
            None => Ok(Stream::Plain(tcp)),
            Some(connector) => {
                let tls = timeout(
                    self.connect_timeout,
                    connector.connect(&self.endpoint.host, tcp),
                )
                .await
                .map_err(|_| TransportError::TimedOut)?
                .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Stream::Tls(Box::new(tls)))
            }
        }
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let stream = self.connect().await?;
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let result = match self.stream.as_mut() {
            None => return Err(TransportError::NotOpen),
            Some(Stream::Plain(s)) => match s.write_all(buf).await {
                Ok(()) => s.flush().await,
                Err(e) => Err(e),
            },
            Some(Stream::Tls(s)) => match s.write_all(buf).await {
                Ok(()) => s.flush().await,
                Err(e) => Err(e),
            },
        };
        result.map_err(TransportError::from_io)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let result = match self.stream.as_mut() {
            None => return Err(TransportError::NotOpen),
            Some(Stream::Plain(s)) => s.read(buf).await,
            Some(Stream::Tls(s)) => s.read(buf).await,
        };
        result.map_err(TransportError::from_io)
    }

    async fn close(&mut self) {
        // The stream is dropped either way; a failed shutdown usually means
        // the peer already went away.
        match self.stream.take() {
            Some(Stream::Plain(mut s)) => {
                let _ = s.shutdown().await;
            }
            Some(Stream::Tls(mut s)) => {
                let _ = s.shutdown().await;
            }
            None => {}
        }
    }
}
