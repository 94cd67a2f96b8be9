use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use axum::body::Body;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use predicates::prelude::*;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::process::Command;
use std::time::Duration;
use timings::command::NAME;

fn trickle() -> Body {
    let pieces = futures::stream::iter(["ab", "c"]).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<&'static str, std::io::Error>(piece)
    });
    Body::from_stream(pieces)
}

fn broken() -> Body {
    let items = futures::stream::iter([Ok("x"), Err(std::io::Error::other("broken"))]).then(|item| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        item
    });
    Body::from_stream(items)
}

/// Starts an origin on its own runtime, the binary under test runs blocking.
fn start_origin() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let router = Router::new()
                .route("/trickle", get(|| async { trickle() }))
                .route("/broken", get(|| async { broken() }));
            axum::serve(listener, router).await.unwrap();
        });
    });
    addr
}

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn test_command_measure() -> Result<(), Box<dyn std::error::Error>> {
    let origin = start_origin();
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure").arg(format!("http://{origin}/trickle"));
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("200 OK"))
        .stdout(predicate::str::contains("\"ab\""))
        .stdout(predicate::str::contains("end"))
        .stdout(predicate::str::contains("chunks=2"))
        .stdout(predicate::str::contains("errors=0"));
    Ok(())
}

#[test]
fn test_command_measure_json_output() -> Result<(), Box<dyn std::error::Error>> {
    let origin = start_origin();
    let temp = assert_fs::TempDir::new()?;
    let file = temp.child("frames.ndjson");
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure")
        .arg(format!("http://{origin}/trickle"))
        .arg("--json")
        .arg("--output")
        .arg(file.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("{\"type\":\"start\""))
        .stdout(predicate::str::contains("{\"type\":\"end\""))
        .stderr(predicate::str::contains("chunks=2"));
    file.assert(predicate::str::contains("\"data\":{\"chunk\":\"ab\"}"));
    file.assert(predicate::str::ends_with("}\n"));
    temp.close()?;
    Ok(())
}

#[test]
fn test_command_measure_broken() -> Result<(), Box<dyn std::error::Error>> {
    let origin = start_origin();
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure").arg(format!("http://{origin}/broken"));
    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("\"x\""))
        .stdout(predicate::str::contains("error"))
        .stdout(predicate::str::contains("errors=1"));
    Ok(())
}

#[test]
fn test_command_measure_unreachable() -> Result<(), Box<dyn std::error::Error>> {
    let addr = free_addr();
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure").arg(format!("http://{addr}/"));
    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("Could not fetch"))
        .stdout(predicate::str::contains("total=-"));
    Ok(())
}

#[test]
fn test_command_measure_unsupported_compression() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure").arg("http://127.0.0.1/").arg("--compress").arg("zstd");
    cmd.assert().failure().stderr(predicate::str::contains("zstd"));
    Ok(())
}

#[test]
fn test_command_serve() -> Result<(), Box<dyn std::error::Error>> {
    let origin = start_origin();
    let listen = free_addr();
    let mut server = Command::cargo_bin(NAME)?.arg("serve").arg("--listen").arg(listen.to_string()).spawn()?;
    let mut ready = false;
    for _ in 0..100 {
        if TcpStream::connect(listen).is_ok() {
            ready = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("measure")
        .arg(format!("http://{origin}/trickle"))
        .arg("--server")
        .arg(format!("http://{listen}/api/stream"));
    let assert = cmd.assert();
    server.kill()?;
    server.wait()?;
    assert!(ready);
    assert.success().stdout(predicate::str::contains("chunks=2"));
    Ok(())
}
