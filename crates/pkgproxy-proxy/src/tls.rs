//! TLS interception: which CONNECT tunnels to open up, and the per-session
//! leaf certificates presented to clients when we do.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use hudsucker::certificate_authority::CertificateAuthority;
use hudsucker::hyper::http::uri::Authority;
use hudsucker::rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::crypto::CryptoProvider;
use hudsucker::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use hudsucker::rustls::server::{ClientHello, ResolvesServerCert};
use hudsucker::rustls::sign::CertifiedKey;
use hudsucker::rustls::ServerConfig;
use tracing::{debug, error};

use crate::ca::LoadedCa;
use crate::error::{ProxyError, Result};

/// Allow-list of hosts whose CONNECT tunnels are decrypted.
///
/// Entries are exact host names, `*.example.com` for any subdomain, or `*`
/// for every host. Everything else is relayed blind.
#[derive(Debug, Clone, Default)]
pub struct InterceptPolicy {
    all: bool,
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl InterceptPolicy {
    /// Intercepts nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Intercepts every host.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Builds a policy from host patterns.
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for host in hosts {
            let host = host.as_ref().trim().to_ascii_lowercase();
            if host == "*" {
                policy.all = true;
            } else if let Some(domain) = host.strip_prefix("*.") {
                policy.suffixes.push(format!(".{}", domain));
            } else if !host.is_empty() {
                policy.exact.insert(host);
            }
        }
        policy
    }

    /// Returns true if no host is intercepted.
    pub fn is_empty(&self) -> bool {
        !self.all && self.exact.is_empty() && self.suffixes.is_empty()
    }

    /// Returns true if the tunnel to `host` should be decrypted.
    pub fn should_intercept(&self, host: &str) -> bool {
        if self.all {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.exact.contains(&host) || self.suffixes.iter().any(|s| host.ends_with(s.as_str()))
    }
}

/// Leaf certificate and TLS server config for one intercepted host.
///
/// Minted when a tunnel is opened and dropped with it.
#[derive(Debug)]
pub struct MitmSession {
    pub host: String,
    pub server_config: Arc<ServerConfig>,
}

impl MitmSession {
    /// Generates a leaf for `host`, signed by `ca`.
    pub fn mint(ca: &LoadedCa, host: &str, provider: &Arc<CryptoProvider>) -> Result<Self> {
        let tls = |e: &dyn std::fmt::Display| ProxyError::Tls(format!("{}: {}", host, e));

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| tls(&e))?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, host);
        params.distinguished_name = name;

        match host.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into().map_err(|e| tls(&e))?)),
        }

        let leaf_key = KeyPair::generate().map_err(|e| tls(&e))?;
        let leaf_cert = params.signed_by(&leaf_key, &ca.issuer).map_err(|e| tls(&e))?;

        let chain = vec![leaf_cert.der().clone(), ca.cert_der.clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls(&e))?
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .map_err(|e| tls(&e))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            host: host.to_string(),
            server_config: Arc::new(server_config),
        })
    }
}

/// Cert resolver that never offers a certificate, so the handshake fails.
#[derive(Debug)]
struct RefuseHandshake;

impl ResolvesServerCert for RefuseHandshake {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Mints a fresh [`MitmSession`] for every intercepted tunnel.
///
/// Leaf certificates are not cached. If minting fails the client gets a
/// config that cannot complete a handshake, which fails only that session.
pub struct SessionAuthority {
    ca: Arc<LoadedCa>,
    provider: Arc<CryptoProvider>,
    refuse: Arc<ServerConfig>,
}

impl std::fmt::Debug for SessionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthority")
            .field("ca", &self.ca)
            .finish()
    }
}

impl SessionAuthority {
    pub fn new(ca: LoadedCa) -> Result<Self> {
        let provider = Arc::new(default_provider());
        let refuse = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(RefuseHandshake));

        Ok(Self {
            ca: Arc::new(ca),
            provider,
            refuse: Arc::new(refuse),
        })
    }

    /// Authority backed by an in-memory CA, for when nothing is intercepted.
    pub fn ephemeral() -> Result<Self> {
        Self::new(LoadedCa::ephemeral()?)
    }

    /// Returns the CA certificate PEM.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    /// Mints a session for `host`.
    pub fn mint(&self, host: &str) -> Result<MitmSession> {
        MitmSession::mint(&self.ca, host, &self.provider)
    }
}

impl CertificateAuthority for SessionAuthority {
    fn gen_server_config(
        &self,
        authority: &Authority,
    ) -> impl Future<Output = Arc<ServerConfig>> + Send {
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        let config = match self.mint(host) {
            Ok(session) => {
                debug!("Minted leaf certificate for {}", session.host);
                session.server_config
            }
            Err(e) => {
                error!("Failed to mint certificate: {}", e);
                self.refuse.clone()
            }
        };
        async move { config }
    }
}
