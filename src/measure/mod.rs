pub(crate) mod body;

pub use body::Encoding;
pub use body::Utf8;

use crate::Clock;
use crate::Error;
use crate::Monotonic;
use crate::Report;
use crate::Reporter;
use crate::Result;
use body::Body;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::header::ACCEPT_ENCODING;
use reqwest::header::CONTENT_ENCODING;
use reqwest::Client;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::Url;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::str::FromStr;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// `Accept-Encoding` preference sent to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "br")]
    Brotli,
    #[serde(rename = "*")]
    Any,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Brotli => "br",
            Compression::Any => "*",
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "br" => Ok(Compression::Brotli),
            "*" => Ok(Compression::Any),
            _ => Err(Error::UnsupportedCompression(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Preferred content encoding, `identity` when unset
    pub compress: Option<Compression>,
    /// Bound on waiting for response headers
    pub timeout: Option<Duration>,
    /// Bound on waiting for each body chunk
    pub idle: Option<Duration>,
    /// Frames buffered between the origin reader and the consumer
    pub capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compress: None,
            timeout: Some(Duration::from_secs(30)),
            idle: Some(Duration::from_secs(30)),
            capacity: 8,
        }
    }
}

impl Options {
    pub fn accept_encoding(&self) -> &'static str {
        self.compress.map(Compression::as_str).unwrap_or("identity")
    }
}

/// Where a measurement stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Started,
    Streaming,
    Ended,
    Errored,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Errored | Phase::Cancelled)
    }
}

/// The framed report stream of one measurement.
///
/// Frames are produced by a background task as the origin delivers them.
/// Dropping the measurement aborts that task and releases the origin
/// connection.
pub struct Measurement {
    receiver: mpsc::Receiver<Bytes>,
    task: JoinHandle<Phase>,
}

impl Measurement {
    /// Stops frame production; frames already buffered are still yielded.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for Measurement {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Measurement {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Fetches `url` and returns its framed timing reports.
///
/// Failing to get a response is returned as an error rather than framed.
pub async fn measure(client: &Client, url: &str, options: &Options) -> Result<Measurement> {
    measure_with_clock(client, url, options, Monotonic::default()).await
}

pub async fn measure_with_clock<C>(client: &Client, url: &str, options: &Options, clock: C) -> Result<Measurement>
where
    C: Clock + Send + 'static,
{
    let url = Url::parse(url).map_err(|error| Error::InvalidUrl(format!("{url}: {error}")))?;
    let mut reporter = Reporter::with_clock(clock);
    log::info!("Measuring {url} with Accept-Encoding: {}", options.accept_encoding());
    let request = client.get(url.clone()).header(ACCEPT_ENCODING, options.accept_encoding());
    let sent = match options.timeout {
        Some(limit) => time::timeout(limit, request.send()).await.map_err(|_| Error::Timeout(limit))?,
        None => request.send().await,
    };
    let response = sent.map_err(Error::Fetch)?;
    if matches!(
        response.status(),
        StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return Err(Error::NoBody);
    }
    let start = Report::start(
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or_default(),
        headers(response.headers()),
    );
    let (sender, receiver) = mpsc::channel(options.capacity.max(1));
    // stamped on response arrival, the pump task may be polled later
    let phase = match sender.try_send(Bytes::from(reporter.encode(start))) {
        Ok(()) => Phase::Started,
        Err(_) => Phase::Cancelled,
    };
    log::info!("Headers from {url}: {} {:?}", response.status(), response.version());
    let content_encoding = response.headers().get(CONTENT_ENCODING).map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
    let encoding = Encoding::from_header(content_encoding.as_deref()).unwrap_or_else(|| {
        log::warn!("Forwarding {url} body with unsupported Content-Encoding {content_encoding:?} undecoded");
        Encoding::Identity
    });
    let pump = Pump {
        reporter,
        sender,
        phase,
        chunks: 0,
    };
    let task = tokio::spawn(pump.run(response, Body::new(encoding), options.idle, url));
    Ok(Measurement { receiver, task })
}

fn headers(map: &HeaderMap) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::<String, String>::new();
    for (name, value) in map.iter() {
        let value = String::from_utf8_lossy(value.as_bytes());
        match headers.get_mut(name.as_str()) {
            Some(joined) => {
                joined.push_str(", ");
                joined.push_str(&value);
            }
            None => {
                headers.insert(name.to_string(), value.into_owned());
            }
        }
    }
    headers
}

struct Pump<C> {
    reporter: Reporter<C>,
    sender: mpsc::Sender<Bytes>,
    phase: Phase,
    chunks: usize,
}

impl<C: Clock> Pump<C> {
    async fn run(mut self, mut response: Response, mut body: Body, idle: Option<Duration>, url: Url) -> Phase {
        while !self.phase.is_terminal() {
            let next = tokio::select! {
                _ = self.sender.closed() => None,
                next = read(&mut response, idle) => Some(next),
            };
            match next {
                None => self.phase = Phase::Cancelled,
                Some(Ok(Some(bytes))) => match body.push(&bytes) {
                    Ok(text) => self.chunk(text).await,
                    Err(error) => self.fail(error).await,
                },
                Some(Ok(None)) => match body.finish() {
                    Ok(text) => {
                        self.chunk(text).await;
                        self.emit(Report::End).await;
                    }
                    Err(error) => self.fail(error).await,
                },
                Some(Err(error)) => self.fail(error).await,
            }
        }
        match self.phase {
            Phase::Cancelled => log::debug!("Measurement of {url} cancelled after {} chunks", self.chunks),
            phase => log::info!("Measured {url}: {phase:?} with {} chunks in {:.1}ms", self.chunks, self.reporter.elapsed()),
        }
        self.phase
    }

    async fn chunk(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        log::trace!("Chunk of {} bytes", text.len());
        self.chunks += 1;
        self.emit(Report::chunk(text)).await;
    }

    async fn fail(&mut self, error: Error) {
        log::warn!("Measurement failed mid-stream: {error}");
        self.emit(Report::error(error.to_string())).await;
    }

    async fn emit(&mut self, report: Report) {
        if self.phase.is_terminal() {
            return;
        }
        let next = match report {
            Report::Start(_) => Phase::Started,
            Report::Chunk(_) => Phase::Streaming,
            Report::End => Phase::Ended,
            Report::Error(_) => Phase::Errored,
        };
        let frame = self.reporter.encode(report);
        self.phase = match self.sender.send(Bytes::from(frame)).await {
            Ok(()) => next,
            Err(_) => Phase::Cancelled,
        };
    }
}

async fn read(response: &mut Response, idle: Option<Duration>) -> Result<Option<Bytes>> {
    match idle {
        Some(limit) => match time::timeout(limit, response.chunk()).await {
            Ok(chunk) => chunk.map_err(Error::Read),
            Err(_) => Err(Error::Idle(limit)),
        },
        None => response.chunk().await.map_err(Error::Read),
    }
}

#[cfg(test)]
async fn collect(measurement: Measurement) -> Vec<crate::TimedReport> {
    use futures::StreamExt;
    let frames = measurement.collect::<Vec<Bytes>>().await;
    let mut reports = Vec::new();
    for frame in frames {
        let frame = String::from_utf8(frame.to_vec()).unwrap();
        assert!(frame.ends_with('\n'));
        reports.extend(crate::decode(&frame, &mut crate::Log));
    }
    reports
}

#[cfg(test)]
fn kinds(reports: &[crate::TimedReport]) -> Vec<&'static str> {
    reports.iter().map(|report| report.report.kind()).collect()
}

#[cfg(test)]
fn chunks(reports: &[crate::TimedReport]) -> Vec<String> {
    reports
        .iter()
        .filter_map(|report| match &report.report {
            Report::Chunk(chunk) => Some(chunk.chunk.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_compression_from_str() {
    assert_eq!(Compression::Gzip, "gzip".parse::<Compression>().unwrap());
    assert_eq!(Compression::Brotli, "br".parse::<Compression>().unwrap());
    assert_eq!(Compression::Any, "*".parse::<Compression>().unwrap());
    assert!(matches!("zstd".parse::<Compression>(), Err(Error::UnsupportedCompression(_))));
    assert_eq!("br", Compression::Brotli.to_string());
}

#[test]
fn test_accept_encoding() {
    let mut options = Options::default();
    assert_eq!("identity", options.accept_encoding());
    options.compress = Some(Compression::Any);
    assert_eq!("*", options.accept_encoding());
}

#[test]
fn test_headers_join_repeated() {
    let mut map = HeaderMap::new();
    map.append("vary", "accept".parse().unwrap());
    map.append("vary", "origin".parse().unwrap());
    map.insert("content-type", "text/plain".parse().unwrap());
    let headers = headers(&map);
    assert_eq!(Some(&String::from("accept, origin")), headers.get("vary"));
    assert_eq!(Some(&String::from("text/plain")), headers.get("content-type"));
}

#[tokio::test]
async fn test_measure_trickle() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let measurement = measure(&client, &format!("http://{addr}/trickle"), &Options::default()).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(vec!["start", "chunk", "chunk", "end"], kinds(&reports));
    match &reports[0].report {
        Report::Start(start) => {
            assert_eq!(200, start.status);
            assert_eq!("OK", start.status_text);
            assert_eq!(Some(&String::from("text/plain")), start.headers.get("content-type"));
        }
        report => panic!("unexpected {report:?}"),
    }
    assert_eq!(vec![String::from("ab"), String::from("c")], chunks(&reports));
    assert_eq!(reports[0].timing, reports[0].delta);
    assert!(reports[1].delta >= 0.0);
    assert!(reports[1].timing >= reports[0].timing);
    for pair in reports.windows(2) {
        assert!(pair[1].timing >= pair[0].timing);
        assert!(pair[1].delta >= 0.0);
    }
}

#[tokio::test]
async fn test_measure_broken_stream() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let measurement = measure(&client, &format!("http://{addr}/broken"), &Options::default()).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(vec!["start", "chunk", "error"], kinds(&reports));
    assert_eq!(vec![String::from("x")], chunks(&reports));
}

#[tokio::test]
async fn test_measure_gzip() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        compress: Some(Compression::Gzip),
        ..Options::default()
    };
    let measurement = measure(&client, &format!("http://{addr}/gzip"), &options).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(Some(&"end"), kinds(&reports).last());
    match &reports[0].report {
        Report::Start(start) => assert_eq!(Some(&String::from("gzip")), start.headers.get("content-encoding")),
        report => panic!("unexpected {report:?}"),
    }
    assert_eq!(crate::tests::COMPRESSED_TEXT, chunks(&reports).concat());
}

#[tokio::test]
async fn test_measure_brotli() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        compress: Some(Compression::Brotli),
        ..Options::default()
    };
    let measurement = measure(&client, &format!("http://{addr}/brotli"), &options).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(Some(&"end"), kinds(&reports).last());
    assert_eq!(crate::tests::COMPRESSED_TEXT, chunks(&reports).concat());
}

#[tokio::test]
async fn test_measure_split_character() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let measurement = measure(&client, &format!("http://{addr}/split"), &Options::default()).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(vec!["start", "chunk", "end"], kinds(&reports));
    assert_eq!(vec![String::from("✓!")], chunks(&reports));
}

#[tokio::test]
async fn test_measure_sends_accept_encoding() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let url = format!("http://{addr}/echo");
    let reports = collect(measure(&client, &url, &Options::default()).await.unwrap()).await;
    assert_eq!("identity", chunks(&reports).concat());
    let options = Options {
        compress: Some(Compression::Any),
        ..Options::default()
    };
    let reports = collect(measure(&client, &url, &options).await.unwrap()).await;
    assert_eq!("*", chunks(&reports).concat());
}

#[tokio::test]
async fn test_measure_no_body() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let result = measure(&client, &format!("http://{addr}/empty"), &Options::default()).await;
    assert!(matches!(result, Err(Error::NoBody)));
}

#[tokio::test]
async fn test_measure_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = crate::client::build(None).unwrap();
    let result = measure(&client, &format!("http://{addr}/"), &Options::default()).await;
    assert!(matches!(result, Err(Error::Fetch(_))));
}

#[tokio::test]
async fn test_measure_invalid_url() {
    let client = crate::client::build(None).unwrap();
    let result = measure(&client, "not a url", &Options::default()).await;
    assert!(matches!(result, Err(Error::InvalidUrl(_))));
}

#[tokio::test]
async fn test_measure_header_timeout() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        timeout: Some(Duration::from_millis(100)),
        ..Options::default()
    };
    let result = measure(&client, &format!("http://{addr}/slow"), &options).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tokio::test]
async fn test_measure_idle_timeout() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        idle: Some(Duration::from_millis(100)),
        ..Options::default()
    };
    let measurement = measure(&client, &format!("http://{addr}/stall"), &options).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(Some(&"error"), kinds(&reports).last());
    assert!(!kinds(&reports).contains(&"end"));
}

#[tokio::test]
async fn test_measure_abort() {
    use futures::StreamExt;
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        capacity: 1,
        ..Options::default()
    };
    let mut measurement = measure(&client, &format!("http://{addr}/forever"), &options).await.unwrap();
    let start = measurement.next().await.unwrap();
    assert!(String::from_utf8_lossy(&start).starts_with("{\"type\":\"start\""));
    measurement.abort();
    time::timeout(Duration::from_secs(2), async {
        while !measurement.is_finished() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let rest = time::timeout(Duration::from_secs(2), measurement.collect::<Vec<Bytes>>()).await.unwrap();
    assert!(rest.len() <= 1);
}

#[tokio::test]
async fn test_measure_with_clock() {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let ticks = Arc::new(AtomicU64::new(0));
    let clock = {
        let ticks = ticks.clone();
        move || Duration::from_millis(ticks.fetch_add(10, Ordering::SeqCst))
    };
    let measurement = measure_with_clock(&client, &format!("http://{addr}/trickle"), &Options::default(), clock).await.unwrap();
    let reports = collect(measurement).await;
    assert_eq!(vec!["start", "chunk", "chunk", "end"], kinds(&reports));
    let timings = reports.iter().map(|report| (report.timing, report.delta)).collect::<Vec<(f64, f64)>>();
    assert_eq!(vec![(10.0, 10.0), (20.0, 10.0), (30.0, 10.0), (40.0, 10.0)], timings);
}

#[tokio::test]
async fn test_measure_start_stamped_on_response() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let mut measurement = measure(&client, &format!("http://{addr}/forever"), &Options::default()).await.unwrap();
    // the current-thread runtime has not polled the pump yet
    let start = measurement.receiver.try_recv().unwrap();
    assert!(String::from_utf8_lossy(&start).starts_with("{\"type\":\"start\""));
    assert!(measurement.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_measure_backpressure() {
    let addr = crate::tests::start_server().await;
    let client = crate::client::build(None).unwrap();
    let options = Options {
        capacity: 2,
        ..Options::default()
    };
    let mut measurement = measure(&client, &format!("http://{addr}/forever"), &options).await.unwrap();
    time::sleep(Duration::from_millis(600)).await;
    let mut buffered = Vec::new();
    while let Ok(frame) = measurement.receiver.try_recv() {
        buffered.push(frame);
    }
    assert_eq!(options.capacity, buffered.len());
    assert!(!measurement.is_finished());
    let reports = buffered
        .iter()
        .flat_map(|frame| crate::decode(&String::from_utf8_lossy(frame), &mut crate::Log))
        .collect::<Vec<crate::TimedReport>>();
    assert_eq!(vec!["start", "chunk"], kinds(&reports));
}
