use clap::Parser;
use clap::Subcommand;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use timings::command;
use timings::Compression;
use timings::Options;

#[derive(Parser)]
#[command(name = command::NAME, version, about, long_about = None)]
struct Interface {
    /// Use verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the timing of a streamed response
    Measure {
        /// Origin url
        #[command()]
        url: String,
        /// Accept-Encoding to request: gzip, br or *
        #[arg(short, long)]
        compress: Option<Compression>,
        /// Timeout waiting for response headers
        #[arg(short, long, env = "TIMINGS_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
        /// Timeout waiting for each body chunk
        #[arg(short, long, env = "TIMINGS_IDLE", default_value = "30s", value_parser = humantime::parse_duration)]
        idle: Duration,
        /// Frames buffered ahead of the output
        #[arg(long, default_value_t = 8)]
        capacity: usize,
        /// Measure through a remote endpoint, e.g. http://127.0.0.1:3000/api/stream
        #[arg(short, long)]
        server: Option<String>,
        /// File receiving the raw frames
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print raw frames instead of report lines
        #[arg(short, long)]
        json: bool,
    },
    /// Serve the measurement endpoint
    Serve {
        /// Listen address
        #[arg(short, long, env = "TIMINGS_LISTEN", default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
        /// Timeout waiting for response headers
        #[arg(short, long, env = "TIMINGS_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
        /// Timeout waiting for each body chunk
        #[arg(short, long, env = "TIMINGS_IDLE", default_value = "30s", value_parser = humantime::parse_duration)]
        idle: Duration,
        /// Frames buffered per measurement
        #[arg(long, default_value_t = 8)]
        capacity: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let interface = Interface::parse();
    command::init_logging(interface.verbose);
    let succeeded = match interface.command {
        Commands::Measure {
            url,
            compress,
            timeout,
            idle,
            capacity,
            server,
            output,
            json,
        } => {
            let options = Options {
                compress,
                timeout: Some(timeout),
                idle: Some(idle),
                capacity,
            };
            command::measure(url, options, server, output, json).await
        }
        Commands::Serve {
            listen,
            timeout,
            idle,
            capacity,
        } => {
            let options = Options {
                compress: None,
                timeout: Some(timeout),
                idle: Some(idle),
                capacity,
            };
            command::serve(listen, options).await
        }
    };
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
