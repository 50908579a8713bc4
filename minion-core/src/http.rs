//! HTTP clients for the provider, publisher and webhook integrations.

use std::sync::Once;

use reqwest::Client;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the aws-lc-rs rustls provider for this process.
///
/// reqwest is built without a bundled provider, so this must run before
/// the first client is constructed.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Err means a provider was already installed elsewhere.
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// A reqwest client backed by the process-wide rustls provider.
pub fn client() -> Client {
    install_crypto_provider();
    Client::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_installs_a_provider() {
        let _client = client();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());

        // Repeated installs are harmless.
        install_crypto_provider();
        let _again = client();
    }
}
