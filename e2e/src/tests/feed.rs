use futures_util::SinkExt;
use ipns_publisher::{
    test_utils::{MockStore, RecordFactory},
    IpnsRecord,
};
use ipns_relay::Config;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{start_relay, test_config, wait_for_puts};

/// A feed that sends `updates` once to the first subscriber and keeps the
/// connection open.
async fn one_shot_feed(updates: Vec<String>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for update in updates {
            ws.send(Message::Text(update)).await.unwrap();
        }
        futures_util::future::pending::<()>().await;
    });
    Url::parse(&format!("ws://{address}")).unwrap()
}

#[tokio::test]
async fn feed_updates_are_published() {
    let first = RecordFactory::new(10);
    let second = RecordFactory::new(11);
    let endpoint = one_shot_feed(vec![
        json!({ "key": first.key().as_str(), "value": "/ipfs/a", "record": first.record(1).build_base64() })
            .to_string(),
        json!({ "key": second.key().as_str(), "value": "/ipfs/b", "record": second.record(4).build_base64() })
            .to_string(),
    ])
    .await;

    let store = MockStore::new();
    let config = Config {
        server_enabled: false,
        feed_enabled: true,
        feed_endpoint: endpoint,
        ..test_config()
    };
    let relay = start_relay(config, &store).await;
    assert!(relay.server().is_none());

    wait_for_puts(&store, 2).await;
    let first_put = store.puts_for(&first.key().path());
    assert_eq!(first_put.len(), 1);
    assert_eq!(IpnsRecord::decode(&first_put[0].record).unwrap().sequence(), 1);
    let second_put = store.puts_for(&second.key().path());
    assert_eq!(IpnsRecord::decode(&second_put[0].record).unwrap().sequence(), 4);
}

#[tokio::test]
async fn feed_and_broadcast_share_the_coordinator() {
    let factory = RecordFactory::new(12);
    let endpoint = one_shot_feed(vec![json!({
        "key": factory.key().as_str(),
        "record": factory.record(1).build_base64(),
    })
    .to_string()])
    .await;

    let store = MockStore::new();
    let config = Config {
        feed_enabled: true,
        feed_endpoint: endpoint,
        ..test_config()
    };
    let relay = start_relay(config, &store).await;
    wait_for_puts(&store, 1).await;

    let url = relay.server().unwrap().broadcast_url().unwrap();
    let response = reqwest::Client::new()
        .post(url)
        .header("Authorization", "secret")
        .json(&json!({ "key": factory.key().as_str(), "record": factory.record(2).build_base64() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    wait_for_puts(&store, 2).await;
    let latest = store.record(&factory.key().path()).unwrap();
    assert_eq!(IpnsRecord::decode(&latest).unwrap().sequence(), 2);
}
