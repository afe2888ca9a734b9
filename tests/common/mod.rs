//! Shared helpers for integration tests: unique ports, per-node data dirs,
//! and router construction for both roles.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use veilnet::config::Config;
use veilnet::router::Router;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

pub fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a relay bound to localhost on a fresh port.
pub async fn spawn_relay(data_dir: &Path) -> Router {
    let port = next_port();
    let text = format!(
        "[router]\n\
         netid = veilnet\n\
         data-dir = {}\n\
         block-bogons = false\n\
         \n\
         [bind]\n\
         127.0.0.1 = {port}\n",
        data_dir.display()
    );
    let config = Config::parse(&text).expect("relay config parses");
    Router::new(config).await.expect("relay starts")
}

/// Start a client with short paths so builds succeed on small networks.
pub async fn spawn_client(data_dir: &Path, hops: usize, paths: usize) -> Router {
    let text = format!(
        "[router]\n\
         netid = veilnet\n\
         data-dir = {}\n\
         block-bogons = false\n\
         \n\
         [network]\n\
         hops = {hops}\n\
         paths = {paths}\n",
        data_dir.display()
    );
    let config = Config::parse(&text).expect("client config parses");
    Router::new(config).await.expect("client starts")
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
