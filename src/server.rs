use crate::codec;
use crate::measure;
use crate::Compression;
use crate::Error;
use crate::Options;
use crate::Result;
use crate::TimedReport;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use reqwest::Client;
use reqwest::Url;
use serde::Deserialize;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Body of a measurement request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<String>,
}

impl Request {
    /// Checks the request before any network activity.
    pub fn validate(&self) -> Result<(Url, Option<Compression>)> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::InvalidUrl(String::from("url is required")));
        }
        let url = Url::parse(url).map_err(|error| Error::InvalidUrl(format!("{url}: {error}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("{url}: scheme must be http or https")));
        }
        let compress = self.compress.as_deref().map(str::parse::<Compression>).transpose()?;
        Ok((url, compress))
    }
}

/// Server-wide state shared by every request.
pub struct Shared {
    pub client: Client,
    pub options: Options,
}

pub fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/api/stream", post(stream))
        .route("/health", get(health))
        .with_state(shared)
}

/// Serves the endpoint until Ctrl-C.
pub async fn serve(listener: TcpListener, shared: Arc<Shared>) -> std::io::Result<()> {
    log::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(shared)).with_graceful_shutdown(shutdown()).await
}

async fn shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutting down"),
        Err(error) => log::error!("Could not listen for Ctrl-C: {error}"),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn stream(State(shared): State<Arc<Shared>>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<Request>(&body) {
        Ok(request) => request,
        Err(error) => return failure(StatusCode::BAD_REQUEST, Error::Json(error)),
    };
    let (url, compress) = match request.validate() {
        Ok(valid) => valid,
        Err(error) => return failure(StatusCode::BAD_REQUEST, error),
    };
    let options = Options {
        compress,
        ..shared.options.clone()
    };
    match measure::measure(&shared.client, url.as_str(), &options).await {
        Ok(measurement) => {
            let frames = measurement.map(Ok::<Bytes, Infallible>);
            (StatusCode::OK, [(CONTENT_TYPE, "application/json")], Body::from_stream(frames)).into_response()
        }
        Err(error) => failure(StatusCode::INTERNAL_SERVER_ERROR, error),
    }
}

fn failure(status: StatusCode, error: Error) -> Response {
    log::warn!("Request failed with {status}: {error}");
    let frame = codec::encode(&TimedReport::failure(error.to_string()));
    (status, [(CONTENT_TYPE, "application/json")], frame).into_response()
}

#[cfg(test)]
async fn start_endpoint() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shared = Arc::new(Shared {
        client: crate::client::build(None).unwrap(),
        options: Options::default(),
    });
    tokio::spawn(async move {
        axum::serve(listener, router(shared)).await.unwrap();
    });
    addr
}

#[cfg(test)]
async fn post_stream(addr: std::net::SocketAddr, body: &str) -> (u16, Vec<TimedReport>) {
    let response = Client::new()
        .post(format!("http://{addr}/api/stream"))
        .header(CONTENT_TYPE, "application/json")
        .body(body.to_owned())
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let text = response.text().await.unwrap();
    (status, codec::decode(&text, &mut codec::Log))
}

#[test]
fn test_validate() {
    let request = Request {
        url: String::from(" https://example.com/stream "),
        compress: Some(String::from("br")),
    };
    let (url, compress) = request.validate().unwrap();
    assert_eq!("https://example.com/stream", url.as_str());
    assert_eq!(Some(Compression::Brotli), compress);
    let blank = Request {
        url: String::from("  "),
        compress: None,
    };
    assert!(matches!(blank.validate(), Err(Error::InvalidUrl(_))));
    let relative = Request {
        url: String::from("/relative"),
        compress: None,
    };
    assert!(matches!(relative.validate(), Err(Error::InvalidUrl(_))));
    let ftp = Request {
        url: String::from("ftp://example.com/"),
        compress: None,
    };
    assert!(matches!(ftp.validate(), Err(Error::InvalidUrl(_))));
    let zstd = Request {
        url: String::from("http://example.com/"),
        compress: Some(String::from("zstd")),
    };
    assert!(matches!(zstd.validate(), Err(Error::UnsupportedCompression(_))));
}

#[tokio::test]
async fn test_health() {
    let addr = start_endpoint().await;
    let response = Client::new().get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(200, response.status().as_u16());
    assert_eq!("ok", response.text().await.unwrap());
}

#[tokio::test]
async fn test_stream_rejects_invalid_input() {
    let addr = start_endpoint().await;
    for body in [
        "not json",
        r#"{"compress":"gzip"}"#,
        r#"{"url":"not a url"}"#,
        r#"{"url":"http://127.0.0.1/","compress":"zstd"}"#,
    ] {
        let (status, reports) = post_stream(addr, body).await;
        assert_eq!(400, status, "{body}");
        assert_eq!(1, reports.len(), "{body}");
        assert_eq!("error", reports[0].report.kind());
        assert_eq!((0.0, 0.0), (reports[0].timing, reports[0].delta));
    }
}

#[tokio::test]
async fn test_stream_unreachable_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    drop(listener);
    let addr = start_endpoint().await;
    let (status, reports) = post_stream(addr, &format!(r#"{{"url":"http://{origin}/"}}"#)).await;
    assert_eq!(500, status);
    assert_eq!(1, reports.len());
    assert_eq!((0.0, 0.0), (reports[0].timing, reports[0].delta));
    match &reports[0].report {
        crate::Report::Error(failure) => assert!(failure.message.starts_with("Could not fetch"), "{}", failure.message),
        report => panic!("unexpected {report:?}"),
    }
}

#[tokio::test]
async fn test_stream_live_origin() {
    let origin = crate::tests::start_server().await;
    let addr = start_endpoint().await;
    let (status, reports) = post_stream(addr, &format!(r#"{{"url":"http://{origin}/trickle"}}"#)).await;
    assert_eq!(200, status);
    let kinds = reports.iter().map(|report| report.report.kind()).collect::<Vec<&str>>();
    assert_eq!(vec!["start", "chunk", "chunk", "end"], kinds);
}

#[tokio::test]
async fn test_stream_compressed_origin() {
    let origin = crate::tests::start_server().await;
    let addr = start_endpoint().await;
    let (status, reports) = post_stream(addr, &format!(r#"{{"url":"http://{origin}/gzip","compress":"gzip"}}"#)).await;
    assert_eq!(200, status);
    let text = reports
        .iter()
        .filter_map(|report| match &report.report {
            crate::Report::Chunk(chunk) => Some(chunk.chunk.as_str()),
            _ => None,
        })
        .collect::<String>();
    assert_eq!(crate::tests::COMPRESSED_TEXT, text);
}
