//! Signing RPC between provisioning stations and the vendor signer
//!
//! Requests and responses are single-line JSON objects. In production both
//! ends run TLS 1.3 and authenticate each other with certificates issued by
//! one CA.
//!
//! ```text
//! > {"method":"ping"}
//! < {"ok":true}
//! > {"method":"sign","udi":"..","apptag":"..","apphash":"..","message":".."}
//! < {"ok":true,"kind":"signature"}
//! < {"ok":false,"class":"already-exists","error":".."}
//! ```

use crate::error::{AttestError, ErrorClass};
use crate::hexutil::decode_array;
use crate::message::Message;
use crate::protocol::{RecordKind, SignArgs, SignEndpoint};
use crate::secure_file::read_secure;
use crate::udi::Udi;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Longest accepted request or response line.
pub const MAX_LINE: u64 = 64 * 1024;

/// A Sigsum signer may wait for the log, so be generous.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
enum Request {
    Ping,
    Sign {
        udi: String,
        apptag: String,
        apphash: String,
        message: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn into_result(self) -> Result<Option<String>, AttestError> {
        if self.ok {
            return Ok(self.kind);
        }
        Err(AttestError::Remote {
            class: ErrorClass::from_str_lossy(self.class.as_deref().unwrap_or_default()),
            message: self.error.unwrap_or_default(),
        })
    }
}

impl Request {
    fn from_args(args: &SignArgs) -> Self {
        Request::Sign {
            udi: args.udi.to_hex(),
            apptag: args.app_tag.clone(),
            apphash: hex::encode(args.app_hash),
            message: hex::encode(args.message.as_bytes()),
        }
    }
}

fn sign_args(udi: &str, apptag: String, apphash: &str, message: &str) -> Result<SignArgs, AttestError> {
    Ok(SignArgs {
        udi: Udi::from_hex(udi)?,
        app_tag: apptag,
        app_hash: decode_array(apphash, "app digest")?,
        message: Message::from_bytes(&hex::decode(message)?)?,
    })
}

fn handle(endpoint: &dyn SignEndpoint, line: &str) -> Response {
    log::debug!("RPC request: {}", line);
    let result = serde_json::from_str::<Request>(line)
        .map_err(AttestError::from)
        .and_then(|request| match request {
            Request::Ping => endpoint.ping().map(|_| None),
            Request::Sign {
                udi,
                apptag,
                apphash,
                message,
            } => {
                let args = sign_args(&udi, apptag, &apphash, &message)?;
                endpoint.sign(&args).map(Some)
            }
        });
    match result {
        Ok(kind) => Response {
            ok: true,
            kind: kind.map(|k| k.as_str().to_string()),
            ..Default::default()
        },
        Err(e) => {
            log::warn!("{}: {}", e.class(), e);
            Response {
                ok: false,
                class: Some(e.class().as_str().to_string()),
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}

/// Read one newline terminated line. `None` on a clean end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, AttestError> {
    let mut line = String::new();
    let n = reader.take(MAX_LINE).read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(AttestError::RpcError(
            "line too long or truncated".to_string(),
        ));
    }
    Ok(Some(line.trim_end().to_string()))
}

fn write_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), AttestError> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(())
}

/// Answer requests on one connection until the peer hangs up.
pub fn serve_connection<S: Read + Write>(stream: S, endpoint: &dyn SignEndpoint) -> Result<(), AttestError> {
    let mut reader = BufReader::new(stream);
    while let Some(line) = read_line(&mut reader)? {
        let response = handle(endpoint, &line);
        write_line(reader.get_mut(), &response)?;
    }
    Ok(())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, AttestError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| AttestError::ConfigError(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(AttestError::ConfigError(format!(
            "{}: no certificate found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, AttestError> {
    PrivateKeyDer::from_pem_slice(&read_secure(path)?)
        .map_err(|e| AttestError::ConfigError(format!("{}: {}", path.display(), e)))
}

fn root_store(ca: &Path) -> Result<RootCertStore, AttestError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server side TLS 1.3 that requires a client certificate from `ca`.
pub fn server_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, AttestError> {
    let provider = provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider.clone())
        .build()
        .map_err(|e| AttestError::TlsError(e.to_string()))?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)?;
    Ok(Arc::new(config))
}

/// Client side TLS 1.3 trusting only `ca` and presenting `cert`.
pub fn client_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ClientConfig>, AttestError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(root_store(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)?;
    Ok(Arc::new(config))
}

pub struct RpcServer<E> {
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    endpoint: Arc<E>,
}

impl<E: SignEndpoint + Send + Sync + 'static> RpcServer<E> {
    pub fn bind(addr: &str, tls: Arc<ServerConfig>, endpoint: Arc<E>) -> Result<Self, AttestError> {
        Ok(RpcServer {
            listener: TcpListener::bind(addr)?,
            tls: Some(tls),
            endpoint,
        })
    }

    /// Without TLS. Only for loopback test setups.
    pub fn bind_plain(addr: &str, endpoint: Arc<E>) -> Result<Self, AttestError> {
        log::warn!("Serving signing RPC without TLS on {}", addr);
        Ok(RpcServer {
            listener: TcpListener::bind(addr)?,
            tls: None,
            endpoint,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AttestError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one thread each.
    pub fn serve(&self) -> Result<(), AttestError> {
        log::info!("Listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown peer".to_string());
            log::debug!("Connection from {}", peer);
            let endpoint = Arc::clone(&self.endpoint);
            let tls = self.tls.clone();
            thread::spawn(move || {
                let result = stream
                    .set_read_timeout(Some(RPC_TIMEOUT))
                    .map_err(AttestError::from)
                    .and_then(|_| match tls {
                        Some(config) => ServerConnection::new(config)
                            .map_err(AttestError::from)
                            .and_then(|conn| {
                                serve_connection(StreamOwned::new(conn, stream), endpoint.as_ref())
                            }),
                        None => serve_connection(stream, endpoint.as_ref()),
                    });
                match result {
                    Ok(()) => log::debug!("{} disconnected", peer),
                    Err(e) => log::warn!("Connection from {}: {}", peer, e),
                }
            });
        }
        Ok(())
    }
}

trait Duplex: Read + Write + Send {}

impl<T: Read + Write + Send> Duplex for T {}

/// Talks to a remote signer. Calls on one client are serialized.
pub struct RpcClient {
    stream: Mutex<BufReader<Box<dyn Duplex>>>,
}

impl RpcClient {
    /// `server` is `host:port`; the host must match the server certificate.
    pub fn connect(server: &str, tls: Arc<ClientConfig>) -> Result<Self, AttestError> {
        let (host, _) = server
            .rsplit_once(':')
            .ok_or_else(|| AttestError::ConfigError(format!("server '{}' is not host:port", server)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| AttestError::ConfigError(format!("server name '{}': {}", host, e)))?;
        let tcp = TcpStream::connect(server)?;
        tcp.set_read_timeout(Some(RPC_TIMEOUT))?;
        let conn = ClientConnection::new(tls, name)?;
        log::debug!("Connected to signer {}", server);
        Ok(Self::from_stream(StreamOwned::new(conn, tcp)))
    }

    /// Without TLS. Only for loopback test setups.
    pub fn connect_plain(server: &str) -> Result<Self, AttestError> {
        let tcp = TcpStream::connect(server)?;
        tcp.set_read_timeout(Some(RPC_TIMEOUT))?;
        Ok(Self::from_stream(tcp))
    }

    pub fn from_stream(stream: impl Read + Write + Send + 'static) -> Self {
        let stream: Box<dyn Duplex> = Box::new(stream);
        RpcClient {
            stream: Mutex::new(BufReader::new(stream)),
        }
    }

    fn call(&self, request: &Request) -> Result<Response, AttestError> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|e| AttestError::InternalError(format!("Lock poisoned: {}", e)))?;
        write_line(stream.get_mut(), request)?;
        let line = read_line(&mut *stream)?
            .ok_or_else(|| AttestError::RpcError("signer closed the connection".to_string()))?;
        log::debug!("RPC response: {}", line);
        Ok(serde_json::from_str(&line)?)
    }
}

impl SignEndpoint for RpcClient {
    fn ping(&self) -> Result<(), AttestError> {
        self.call(&Request::Ping)?.into_result()?;
        Ok(())
    }

    fn sign(&self, args: &SignArgs) -> Result<RecordKind, AttestError> {
        let kind = self
            .call(&Request::from_args(args))?
            .into_result()?
            .ok_or_else(|| AttestError::RpcError("sign response without record kind".to_string()))?;
        RecordKind::from_wire(&kind)
    }
}
