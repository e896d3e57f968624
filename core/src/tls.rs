use core::fmt;

use tokio_rustls::rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
    version,
};

use crate::Error;

/// Ready-made TLS material consumed by Tcp endpoints.
///
/// Certificate loading and management belong to an external
/// collaborator; this type only carries the resulting chain, key and
/// trust roots and resolves them into `rustls` configurations pinned to
/// TLS 1.2 as minimum and TLS 1.3 as maximum.
pub struct TlsContext {
    chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,
}

impl TlsContext {
    pub fn new() -> Self {
        Self {
            chain: Vec::new(),
            key: None,
            roots: RootCertStore::empty(),
        }
    }

    /// Attach the server certificate chain and its private key.
    pub fn with_certificate(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.chain = chain;
        self.key = Some(key);
        self
    }

    /// Attach trust roots used by client-side verification.
    pub fn with_roots(mut self, roots: RootCertStore) -> Self {
        self.roots = roots;
        self
    }

    /// Whether at least one certificate pair is present.
    pub fn has_certificates(&self) -> bool {
        !self.chain.is_empty() && self.key.is_some()
    }

    /// Resolve a server configuration, failing with
    /// [`Error::InvalidTlsConfig`] when no certificate pair is present
    /// or the material does not form a valid configuration.
    pub fn server_config(&self) -> Result<ServerConfig, Error> {
        let key = match &self.key {
            Some(key) if !self.chain.is_empty() => key.clone_key(),
            _ => return Err(Error::InvalidTlsConfig),
        };

        ServerConfig::builder_with_protocol_versions(&[&version::TLS12, &version::TLS13])
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), key)
            .map_err(|_| Error::InvalidTlsConfig)
    }

    /// Resolve a client configuration verifying peers against the
    /// attached roots.
    pub fn client_config(&self) -> Result<ClientConfig, Error> {
        Ok(
            ClientConfig::builder_with_protocol_versions(&[&version::TLS12, &version::TLS13])
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth(),
        )
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TlsContext {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.as_ref().map(|k| k.clone_key()),
            roots: self.roots.clone(),
        }
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("certificates", &self.chain.len())
            .field("has_key", &self.key.is_some())
            .field("roots", &self.roots.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_context_has_no_certificates() {
        let ctx = TlsContext::new();
        assert!(!ctx.has_certificates());
        assert!(matches!(
            ctx.server_config(),
            Err(Error::InvalidTlsConfig)
        ));
    }
}
