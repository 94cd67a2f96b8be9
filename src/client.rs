use crate::Error;
use crate::Result;
use reqwest::Client;
use rustls::ClientConfig;
use rustls::RootCertStore;
use std::time::Duration;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Builds the http client used to reach origins.
///
/// Transparent decompression stays off: body bytes are decoded by the
/// measurer so the origin's headers are reported untouched.
pub fn build(connect_timeout: Option<Duration>) -> Result<Client> {
    let store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let mut tls = ClientConfig::builder().with_root_certificates(store).with_no_client_auth();
    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let mut builder = Client::builder().use_preconfigured_tls(tls).user_agent(USER_AGENT);
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder.build().map_err(Error::Client)
}

#[test]
fn test_build() {
    assert!(build(None).is_ok());
    assert!(build(Some(Duration::from_secs(5))).is_ok());
}
