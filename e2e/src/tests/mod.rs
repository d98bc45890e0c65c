mod broadcast;
mod feed;

use std::{sync::Arc, time::Duration};

use ipns_publisher::test_utils::MockStore;
use ipns_relay::{Config, IpnsRelay};

/// Config serving on an OS assigned localhost port with the feed disabled.
fn test_config() -> Config {
    Config {
        listen_socket: "127.0.0.1:0".parse().unwrap(),
        auth_secret: Some("secret".to_string()),
        feed_enabled: false,
        ..Default::default()
    }
}

async fn start_relay(config: Config, store: &MockStore) -> IpnsRelay {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ipns_relay=debug,ipns_publisher=debug")
        .try_init();
    IpnsRelay::start_with_store(config, Arc::new(store.clone()))
        .await
        .unwrap()
}

async fn wait_for_puts(store: &MockStore, count: usize) {
    for _ in 0..500 {
        if store.puts().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} puts, got {}", store.puts().len());
}
