//! Shared utilities for lifecycle and handoff tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use graceful_handoff::net::listener::GENERATION_MARKER;
use serde_json::Value;
use tokio::process::{Child, Command};

/// HTTP client that opens a new connection per request and ignores proxies.
pub fn fresh_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// A demo host process, killed when dropped.
pub struct ServerProcess {
    child: Child,
    pub addr: SocketAddr,
}

impl ServerProcess {
    /// Start the demo binary on `port` as a fresh generation.
    pub fn spawn(port: u16, grace_period_ms: u64) -> Self {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let child = Command::new(env!("CARGO_BIN_EXE_graceful-handoff"))
            .arg("--bind")
            .arg(addr.to_string())
            .arg("--grace-period-ms")
            .arg(grace_period_ms.to_string())
            .env_remove(GENERATION_MARKER)
            .env("RUST_LOG", "graceful_handoff=debug")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        Self { child, addr }
    }

    pub fn pid(&self) -> i32 {
        self.child.id().unwrap() as i32
    }

    pub fn signal(&self, signal: i32) {
        send_signal(self.pid(), signal);
    }

    /// Wait for the process to exit, at most `limit`.
    pub async fn wait(&mut self, limit: Duration) -> ExitStatus {
        tokio::time::timeout(limit, self.child.wait())
            .await
            .expect("server did not exit in time")
            .unwrap()
    }
}

/// Kills a process that is not our direct child (a later generation).
pub struct OrphanGuard(pub i32);

impl Drop for OrphanGuard {
    fn drop(&mut self) {
        if self.0 > 0 {
            unsafe {
                libc::kill(self.0, libc::SIGKILL);
            }
        }
    }
}

pub fn send_signal(pid: i32, signal: i32) {
    let rc = unsafe { libc::kill(pid, signal) };
    assert_eq!(rc, 0, "failed to signal {}", pid);
}

pub fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// `(pid, generation)` reported by the demo host's `/pid` route.
pub async fn fetch_pid(client: &reqwest::Client, addr: SocketAddr) -> reqwest::Result<(i32, String)> {
    let json: Value = client
        .get(format!("http://{}/pid", addr))
        .send()
        .await?
        .json()
        .await?;
    let pid = json["pid"].as_i64().unwrap_or_default() as i32;
    let generation = json["generation"].as_str().unwrap_or_default().to_string();
    Ok((pid, generation))
}

/// Poll `/pid` until the server answers.
pub async fn wait_until_serving(client: &reqwest::Client, addr: SocketAddr) -> (i32, String) {
    for _ in 0..100 {
        if let Ok(found) = fetch_pid(client, addr).await {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server at {} never became ready", addr);
}

/// Poll until nothing accepts connections on `addr`.
pub async fn wait_until_closed(addr: SocketAddr) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} is still accepting connections", addr);
}
