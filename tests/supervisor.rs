//! Process-level tests: the real binary, real signals, real log files.

#![cfg(unix)]

use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};

mod common;

const BINARY: &str = env!("CARGO_BIN_EXE_multiserve");

/// A port that was free a moment ago.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_config(dir: &Path, port: u16, processes: usize) -> std::path::PathBuf {
    write_config_with(dir, port, processes, "echo", "")
}

/// `supervisor_extra` is appended to the `[supervisor]` table.
fn write_config_with(dir: &Path, port: u16, processes: usize, app: &str, supervisor_extra: &str) -> std::path::PathBuf {
    let path = dir.join("multiserve.toml");
    let config = format!(
        r#"
[listener]
bind_address = "127.0.0.1"
port = {port}

[supervisor]
processes = {processes}
check_interval_secs = 0.2
stop_timeout_secs = 3.0
{supervisor_extra}

[logger]
level = "info"
logs_dir = "{logs}"

[[services]]
name = "echo"
prefix = "/echo"
app = "{app}"
"#,
        logs = dir.display(),
    );
    std::fs::write(&path, config).unwrap();
    path
}

async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server never listened on {addr}");
}

fn terminate(child: &Child) {
    let pid = child.id().unwrap();
    let status = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

async fn wait_exit(child: &mut Child) -> std::process::ExitStatus {
    tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("process did not exit")
        .unwrap()
}

#[tokio::test]
async fn test_serve_answers_and_stops_on_sigterm() {
    let dir = common::temp_path("multiserve-serve");
    std::fs::create_dir_all(&dir).unwrap();
    let port = free_port();
    let config = write_config(&dir, port, 1);

    let mut child = Command::new(BINARY)
        .arg("serve")
        .arg(&config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    wait_for_port(addr).await;

    let response = common::raw_request(addr, b"POST /echo/x HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi").await;
    assert_eq!(common::status_of(&response), Some(200));
    assert_eq!(common::body_of(&response), "hi");

    terminate(&child);
    assert!(wait_exit(&mut child).await.success());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_supervisor_serves_and_logs_requests() {
    let dir = common::temp_path("multiserve-supervise");
    std::fs::create_dir_all(&dir).unwrap();
    let port = free_port();
    let config = write_config(&dir, port, 2);
    let log = dir.join("server.log");
    let requests = dir.join("requests.log");

    let mut child = Command::new(BINARY)
        .arg("supervise")
        .arg(&config)
        .arg("-l")
        .arg(&log)
        .arg("-r")
        .arg(&requests)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    wait_for_port(addr).await;

    for i in 0..4 {
        let response = common::raw_request(addr, format!("GET /echo/{i} HTTP/1.1\r\n\r\n").as_bytes()).await;
        assert_eq!(common::status_of(&response), Some(200));
    }
    let missing = common::raw_request(addr, b"GET /nowhere HTTP/1.1\r\n\r\n").await;
    assert_eq!(common::status_of(&missing), Some(404));

    terminate(&child);
    assert!(wait_exit(&mut child).await.success());

    let request_lines = std::fs::read_to_string(&requests).unwrap();
    assert!(request_lines.contains("GET /echo/3"), "{request_lines}");
    assert!(request_lines.contains("GET /nowhere"), "{request_lines}");
    let log_lines = std::fs::read_to_string(&log).unwrap();
    assert!(log_lines.contains("[supervisor]"), "{log_lines}");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_crash_looping_workers_stop_within_stop_timeout() {
    let dir = common::temp_path("multiserve-crashloop");
    std::fs::create_dir_all(&dir).unwrap();
    let port = free_port();
    // Workers fail to load the app and exit at once; the next restart is
    // seconds away when SIGTERM arrives.
    let config = write_config_with(
        &dir,
        port,
        2,
        "no-such-app",
        "restart_delay_ms = 4000\nmax_restart_delay_ms = 4000",
    );

    let mut child = Command::new(BINARY)
        .arg("supervise")
        .arg(&config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    // The supervisor binds before spawning, so the port is up while workers die.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    wait_for_port(addr).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(child.try_wait().unwrap().is_none(), "supervisor exited on its own");

    let started = std::time::Instant::now();
    terminate(&child);
    let status = tokio::time::timeout(Duration::from_secs(3), child.wait())
        .await
        .expect("supervisor did not stop within stop_timeout")
        .unwrap();
    assert!(status.success());
    assert!(started.elapsed() < Duration::from_secs(3));

    std::fs::remove_dir_all(&dir).unwrap();
}
