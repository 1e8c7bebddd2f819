//! End-to-end tests against the demo host binary.
//!
//! Ports are fixed per test in the 28xxx range.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod common;
use common::{OrphanGuard, ServerProcess};

#[tokio::test]
async fn test_sigterm_drains_and_exits_cleanly() {
    let mut server = ServerProcess::spawn(28431, 2_000);
    let client = common::fresh_client();

    let (pid, generation) = common::wait_until_serving(&client, server.addr).await;
    assert_eq!(pid, server.pid());
    assert_eq!(generation, "fresh");

    server.signal(libc::SIGTERM);
    let status = server.wait(Duration::from_secs(5)).await;
    assert!(status.success(), "exit status: {:?}", status);

    common::wait_until_closed(server.addr).await;
}

#[tokio::test]
async fn test_reload_hands_over_without_refused_connections() {
    let mut server = ServerProcess::spawn(28432, 2_000);
    let client = common::fresh_client();
    let addr = server.addr;

    let (parent_pid, _) = common::wait_until_serving(&client, addr).await;

    let running = Arc::new(AtomicBool::new(true));
    let refused = Arc::new(AtomicUsize::new(0));
    let served = Arc::new(AtomicUsize::new(0));
    let load = {
        let (client, running, refused, served) =
            (client.clone(), running.clone(), refused.clone(), served.clone());
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match client.get(format!("http://{}/", addr)).send().await {
                    Ok(res) if res.status().is_success() => {
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) if e.is_connect() => {
                        refused.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    server.signal(libc::SIGUSR2);

    let status = server.wait(Duration::from_secs(5)).await;
    assert!(status.success(), "parent exit status: {:?}", status);

    let mut child = None;
    for _ in 0..100 {
        if let Ok((pid, generation)) = common::fetch_pid(&client, addr).await {
            if pid != parent_pid {
                assert_eq!(generation, "inherited");
                child = Some(pid);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let child_pid = child.expect("next generation never answered");
    let _guard = OrphanGuard(child_pid);

    tokio::time::sleep(Duration::from_millis(200)).await;
    running.store(false, Ordering::SeqCst);
    load.await.unwrap();

    assert_eq!(refused.load(Ordering::SeqCst), 0);
    assert!(served.load(Ordering::SeqCst) > 0);

    common::send_signal(child_pid, libc::SIGTERM);
    common::wait_until_closed(addr).await;
    for _ in 0..100 {
        if !common::is_alive(child_pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_grace_period_expiry_exits_with_failure() {
    let mut server = ServerProcess::spawn(28433, 300);
    let client = common::fresh_client();
    let addr = server.addr;

    common::wait_until_serving(&client, addr).await;

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.get(format!("http://{}/slow?ms=5000", addr)).send().await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    server.signal(libc::SIGINT);
    let status = server.wait(Duration::from_secs(5)).await;

    assert!(!status.success(), "exit status: {:?}", status);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(slow.await.unwrap().is_err());
}

#[tokio::test]
async fn test_ignored_signals_do_not_disturb_serving() {
    let mut server = ServerProcess::spawn(28434, 2_000);
    let client = common::fresh_client();

    let (pid, _) = common::wait_until_serving(&client, server.addr).await;

    server.signal(libc::SIGHUP);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (same_pid, generation) = common::fetch_pid(&client, server.addr).await.unwrap();
    assert_eq!(same_pid, pid);
    assert_eq!(generation, "fresh");

    server.signal(libc::SIGTERM);
    assert!(server.wait(Duration::from_secs(5)).await.success());
}
