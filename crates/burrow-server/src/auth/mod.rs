//! Credential checking for accepted tunnels.

use std::sync::Arc;

use burrow_core::auth;
use burrow_core::error::TunnelResult;
use burrow_core::handshake::Nonce;
use burrow_core::socks5::Authenticator;
use burrow_core::KeyRing;
use tracing::{debug, warn};

/// Validates SOCKS5 credentials as a signature over one connection's nonce.
///
/// The username carries the signed HTTP date and the password the signature
/// blob. A fresh instance is built per accepted connection.
pub struct NonceAuthenticator {
    keys: Arc<KeyRing>,
    nonce: Nonce,
}

impl NonceAuthenticator {
    pub fn new(keys: Arc<KeyRing>, nonce: Nonce) -> Self {
        Self { keys, nonce }
    }
}

impl Authenticator for NonceAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> TunnelResult<()> {
        match auth::validate(&self.keys, &self.nonce, username, password) {
            Ok(key_id) => {
                debug!(key_id, "tunnel credentials accepted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, date = %username, "tunnel credentials rejected");
                Err(e)
            }
        }
    }
}
