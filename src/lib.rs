mod codec;
mod error;
mod report;
mod reporter;
mod summary;

pub mod client;
pub mod measure;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "command")]
pub mod command;

pub use codec::decode;
pub use codec::encode;
pub use codec::Buffer;
pub use codec::Diagnostic;
pub use codec::FrameCodec;
pub use codec::Log;
pub use error::Error;
pub use error::Result;
pub use measure::measure;
pub use measure::Compression;
pub use measure::Measurement;
pub use measure::Options;
pub use report::Chunk;
pub use report::Failure;
pub use report::Report;
pub use report::Start;
pub use report::TimedReport;
pub use reporter::Clock;
pub use reporter::Monotonic;
pub use reporter::Reporter;
pub use reporter::Timer;
pub use summary::Summary;

#[cfg(test)]
pub mod tests {
    use axum::body::Body;
    use axum::http::header::ACCEPT_ENCODING;
    use axum::http::header::CONTENT_ENCODING;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::HeaderMap;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use futures::StreamExt;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    pub const COMPRESSED_TEXT: &str = "A compressed body, decoded one delivery at a time ✓\n\
        It spans several lines so the encoder has something to work with.\n\
        It spans several lines so the encoder has something to work with.\n";

    const PAUSE: Duration = Duration::from_millis(50);

    /// A body delivering each piece after its pause.
    fn paced(pieces: Vec<(Duration, Vec<u8>)>) -> Body {
        let stream = futures::stream::iter(pieces).then(|(pause, piece)| async move {
            sleep(pause).await;
            Ok::<Vec<u8>, std::io::Error>(piece)
        });
        Body::from_stream(stream)
    }

    fn halves(bytes: Vec<u8>) -> Vec<(Duration, Vec<u8>)> {
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        vec![(Duration::ZERO, head.to_vec()), (PAUSE, tail.to_vec())]
    }

    async fn trickle() -> impl IntoResponse {
        let pieces = vec![(PAUSE, b"ab".to_vec()), (PAUSE, b"c".to_vec())];
        ([(CONTENT_TYPE, "text/plain")], paced(pieces))
    }

    async fn broken() -> impl IntoResponse {
        let items = vec![Ok(b"x".to_vec()), Err(std::io::Error::other("broken"))];
        let stream = futures::stream::iter(items).then(|item| async move {
            sleep(PAUSE).await;
            item
        });
        ([(CONTENT_TYPE, "text/plain")], Body::from_stream(stream))
    }

    async fn gzip() -> impl IntoResponse {
        let pieces = halves(crate::measure::body::gzip(COMPRESSED_TEXT));
        ([(CONTENT_TYPE, "text/plain"), (CONTENT_ENCODING, "gzip")], paced(pieces))
    }

    async fn brotli() -> impl IntoResponse {
        let pieces = halves(crate::measure::body::brotli(COMPRESSED_TEXT));
        ([(CONTENT_TYPE, "text/plain"), (CONTENT_ENCODING, "br")], paced(pieces))
    }

    async fn split() -> impl IntoResponse {
        let pieces = vec![(Duration::ZERO, vec![0xE2]), (PAUSE, vec![0x9C, 0x93, b'!'])];
        paced(pieces)
    }

    async fn echo(headers: HeaderMap) -> String {
        headers
            .get(ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    async fn slow() -> &'static str {
        sleep(Duration::from_secs(2)).await;
        "late"
    }

    async fn stall() -> impl IntoResponse {
        paced(vec![(Duration::ZERO, b"a".to_vec()), (Duration::from_secs(5), b"b".to_vec())])
    }

    async fn forever() -> impl IntoResponse {
        let ticks = futures::stream::unfold((), |()| async {
            sleep(Duration::from_millis(20)).await;
            Some((Ok::<&'static str, std::io::Error>("tick\n"), ()))
        });
        Body::from_stream(ticks)
    }

    pub async fn start_server() -> SocketAddr {
        let router = Router::new()
            .route("/text", get(|| async { "Hello, World!" }))
            .route("/lines", get(|| async { "one\ntwo\n" }))
            .route("/trickle", get(trickle))
            .route("/broken", get(broken))
            .route("/gzip", get(gzip))
            .route("/brotli", get(brotli))
            .route("/split", get(split))
            .route("/echo", get(echo))
            .route("/empty", get(|| async { StatusCode::NO_CONTENT }))
            .route("/slow", get(slow))
            .route("/stall", get(stall))
            .route("/forever", get(forever));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}
