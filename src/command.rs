use crate::client;
use crate::codec;
use crate::server;
use crate::server::Request;
use crate::server::Shared;
use crate::Error;
use crate::FrameCodec;
use crate::Options;
use crate::Result;
use crate::Summary;
use crate::TimedReport;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::header::CONTENT_TYPE;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

pub const NAME: &str = env!("CARGO_PKG_NAME");

type Reports = BoxStream<'static, std::io::Result<TimedReport>>;

pub fn init_logging(verbose: bool) {
    let level = if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

/// Measures `url` in-process, or through a remote endpoint when `server` is set.
///
/// Returns false when the measurement failed or did not end.
pub async fn measure(url: String, options: Options, server: Option<String>, output: Option<PathBuf>, json: bool) -> bool {
    let mut output = match output {
        Some(path) => match File::create(&path).await {
            Ok(file) => Some(file),
            Err(error) => {
                eprintln!("Could not create {}: {error}", path.display());
                return false;
            }
        },
        None => None,
    };
    let mut summary = Summary::default();
    let reports = match server {
        Some(endpoint) => remote(&endpoint, &url, &options).await,
        None => local(&url, &options).await,
    };
    let mut reports = match reports {
        Ok(reports) => reports,
        Err(error) => futures::stream::iter([Ok::<TimedReport, std::io::Error>(TimedReport::failure(error.to_string()))]).boxed(),
    };
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        let next = tokio::select! {
            _ = &mut interrupt => {
                log::warn!("Interrupted, cancelling measurement of {url}");
                break;
            }
            next = reports.next() => next,
        };
        let report = match next {
            Some(Ok(report)) => report,
            Some(Err(error)) => TimedReport::failure(error.to_string()),
            None => break,
        };
        let frame = codec::encode(&report);
        if json {
            print!("{frame}");
        } else {
            println!("{report}");
        }
        if let Some(file) = output.as_mut() {
            if let Err(error) = file.write_all(frame.as_bytes()).await {
                log::error!("Could not write frame: {error}");
            }
        }
        summary.add(&report);
    }
    drop(reports);
    if let Some(mut file) = output {
        if let Err(error) = file.flush().await {
            log::error!("Could not flush output: {error}");
        }
    }
    if json {
        eprintln!("{summary}");
    } else {
        println!("{summary}");
    }
    !summary.failed()
}

async fn local(url: &str, options: &Options) -> Result<Reports> {
    let client = client::build(options.timeout)?;
    let measurement = crate::measure(&client, url, options).await?;
    let reader = StreamReader::new(measurement.map(Ok::<Bytes, std::io::Error>));
    Ok(FramedRead::new(reader, FrameCodec::new()).boxed())
}

async fn remote(endpoint: &str, url: &str, options: &Options) -> Result<Reports> {
    let client = client::build(options.timeout)?;
    let request = Request {
        url: url.to_owned(),
        compress: options.compress.map(|compress| compress.to_string()),
    };
    log::info!("Measuring {url} through {endpoint}");
    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&request)?)
        .send()
        .await
        .map_err(Error::Fetch)?;
    if !response.status().is_success() {
        log::warn!("Endpoint {endpoint} answered {}", response.status());
    }
    let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
    Ok(FramedRead::new(reader, FrameCodec::new()).boxed())
}

/// Runs the endpoint on `listen` until Ctrl-C.
pub async fn serve(listen: SocketAddr, options: Options) -> bool {
    let shared = match client::build(options.timeout) {
        Ok(client) => Arc::new(Shared { client, options }),
        Err(error) => {
            eprintln!("{error}");
            return false;
        }
    };
    let served = match TcpListener::bind(listen).await {
        Ok(listener) => server::serve(listener, shared).await,
        Err(error) => Err(error),
    };
    match served {
        Ok(()) => true,
        Err(error) => {
            eprintln!("Could not serve on {listen}: {error}");
            false
        }
    }
}
