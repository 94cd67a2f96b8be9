use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Could not fetch: {}", chain(.0))]
    Fetch(#[source] reqwest::Error),

    #[error("Timed out after {0:?} waiting for response headers")]
    Timeout(Duration),

    #[error("No body found in response")]
    NoBody,

    #[error("Could not build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("Could not read response body: {}", chain(.0))]
    Read(#[source] reqwest::Error),

    #[error("Timed out after {0:?} waiting for the next body chunk")]
    Idle(Duration),

    #[error("Could not decompress response body: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Joins an error with its sources, reqwest keeps the useful part in the source.
fn chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[test]
fn test_display() {
    assert_eq!("No body found in response", Error::NoBody.to_string());
    assert_eq!("Unsupported compression: zstd", Error::UnsupportedCompression(String::from("zstd")).to_string());
    assert_eq!("Timed out after 2s waiting for response headers", Error::Timeout(Duration::from_secs(2)).to_string());
}

#[test]
fn test_chain() {
    #[derive(thiserror::Error, Debug)]
    #[error("connection refused")]
    struct Refused;
    #[derive(thiserror::Error, Debug)]
    #[error("error sending request")]
    struct Sending(#[source] Refused);
    assert_eq!("connection refused", chain(&Refused));
    assert_eq!("error sending request: connection refused", chain(&Sending(Refused)));
}

#[tokio::test]
async fn test_fetch_message_carries_cause() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let error = reqwest::Client::new().get(format!("http://{addr}/")).send().await.unwrap_err();
    let cause = std::error::Error::source(&error).map(ToString::to_string).unwrap();
    let message = Error::Fetch(error).to_string();
    assert!(message.starts_with("Could not fetch: error sending request"), "{message}");
    assert!(message.contains(&cause), "{message}");
}
