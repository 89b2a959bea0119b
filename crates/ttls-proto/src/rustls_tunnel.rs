//! rustls-backed [`Tunnel`]
//!
//! Runs the Phase 1 handshake and record protection on a
//! [`rustls::ServerConnection`]. Only TLS 1.2 is offered; EAP-TTLSv0 keys
//! and implicit challenges come from the RFC 5705 exporter.
//!
//! rustls has no TLS/IA support, so tunnels built here stay on version 0
//! and [`Tunnel::keys`] reports the randoms as unavailable.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use tracing::{debug, trace};

use crate::tunnel::{TlsKeys, Tunnel, TunnelError, TunnelFactory};

/// Load a certificate chain from a PEM file
pub fn load_certificates_from_pem(path: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    use std::fs::File;
    use std::io::BufReader;

    let file = File::open(path).map_err(|e| {
        TunnelError::Config(format!("Failed to open certificate file '{}': {}", path, e))
    })?;

    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TunnelError::Config(format!(
            "No certificates found in '{}'",
            path
        )));
    }

    Ok(certs)
}

/// Load a private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key_from_pem(path: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    use std::fs::File;
    use std::io::BufReader;

    let file = File::open(path)
        .map_err(|e| TunnelError::Config(format!("Failed to open key file '{}': {}", path, e)))?;

    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::Config(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Config(format!("No private key found in '{}'", path)))
}

/// Build a TLS 1.2 server configuration without client certificates
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TunnelError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| TunnelError::Config(format!("Unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Config(format!("Failed to configure server: {}", e)))
}

/// One server-side rustls connection
pub struct RustlsTunnel {
    conn: ServerConnection,
}

impl RustlsTunnel {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, TunnelError> {
        let conn = ServerConnection::new(config)
            .map_err(|e| TunnelError::Handshake(format!("Failed to create connection: {}", e)))?;
        Ok(RustlsTunnel { conn })
    }

    /// Feed TLS records to the connection
    fn read_records(&mut self, input: &[u8]) -> Result<(), rustls::Error> {
        let mut cursor = Cursor::new(input);
        while (cursor.position() as usize) < input.len() {
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(rustls::Error::General(e.to_string())),
            }
            self.conn.process_new_packets()?;
        }
        Ok(())
    }

    /// Drain pending TLS records from the connection
    fn write_records(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for RustlsTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsTunnel")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl Tunnel for RustlsTunnel {
    fn handshake(&mut self, input: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if let Err(e) = self.read_records(input) {
            debug!("TLS: Handshake failed: {}", e);
            return Err(TunnelError::Handshake(e.to_string()));
        }

        let out = self.write_records()?;
        trace!(
            "TLS: Consumed {} bytes, produced {} bytes (handshaking={})",
            input.len(),
            out.len(),
            self.conn.is_handshaking()
        );
        Ok(out)
    }

    fn is_established(&self) -> bool {
        !self.conn.is_handshaking()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if self.conn.is_handshaking() {
            return Err(TunnelError::Encrypt("handshake not complete".to_string()));
        }
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(|e| TunnelError::Encrypt(e.to_string()))?;
        self.write_records()
            .map_err(|e| TunnelError::Encrypt(e.to_string()))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        self.read_records(ciphertext)
            .map_err(|e| TunnelError::Decrypt(e.to_string()))?;

        let mut plaintext = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TunnelError::Decrypt(e.to_string())),
            }
        }
        Ok(plaintext)
    }

    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TunnelError> {
        self.conn
            .export_keying_material(vec![0u8; len], label.as_bytes(), None)
            .map_err(|e| TunnelError::Export(e.to_string()))
    }

    fn keys(&self) -> Result<TlsKeys, TunnelError> {
        Err(TunnelError::KeysUnavailable)
    }
}

/// Hands out [`RustlsTunnel`]s sharing one server configuration
#[derive(Debug, Clone)]
pub struct RustlsTunnelFactory {
    config: Arc<ServerConfig>,
}

impl RustlsTunnelFactory {
    pub fn new(config: ServerConfig) -> Self {
        RustlsTunnelFactory {
            config: Arc::new(config),
        }
    }

    /// Load the server certificate chain and key from PEM files
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self, TunnelError> {
        let certs = load_certificates_from_pem(cert_path)?;
        let key = load_private_key_from_pem(key_path)?;
        debug!(
            "TLS: Loaded {} certificate(s) from '{}'",
            certs.len(),
            cert_path
        );
        Ok(Self::new(build_server_config(certs, key)?))
    }
}

impl TunnelFactory for RustlsTunnelFactory {
    fn create(&self) -> Result<Box<dyn Tunnel>, TunnelError> {
        Ok(Box::new(RustlsTunnel::new(self.config.clone())?))
    }
}
