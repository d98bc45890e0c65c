use base64::{engine::general_purpose::STANDARD, Engine};
use ipns_publisher::test_utils::{MockStore, RecordFactory};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{start_relay, test_config, wait_for_puts};

async fn post(url: &str, secret: Option<&str>, body: &Value) -> (StatusCode, Value) {
    let mut request = reqwest::Client::new().post(url).json(body);
    if let Some(secret) = secret {
        request = request.header("Authorization", secret);
    }
    let response = request.send().await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn broadcast_publishes_record_bytes() {
    let store = MockStore::new();
    let relay = start_relay(test_config(), &store).await;
    let url = relay.server().unwrap().broadcast_url().unwrap();

    let factory = RecordFactory::new(1);
    let record = factory.record(1).value("/ipfs/bafyone").build();
    let body = json!({ "key": factory.key().as_str(), "record": STANDARD.encode(&record) });

    let (status, response) = post(url.as_str(), Some("secret"), &body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response, json!({ "message": "Success" }));

    wait_for_puts(&store, 1).await;
    let puts = store.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].path, format!("/ipns/{}", factory.key().as_str()));
    assert_eq!(puts[0].record.as_ref(), record.as_slice());
}

#[tokio::test]
async fn broadcast_rejections() {
    let store = MockStore::new();
    let relay = start_relay(test_config(), &store).await;
    let url = relay.server().unwrap().broadcast_url().unwrap();
    let factory = RecordFactory::new(2);
    let body = json!({
        "key": factory.key().as_str(),
        "record": factory.record(1).build_base64(),
    });

    let (status, response) = post(url.as_str(), None, &body).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response, json!({ "message": "Authorization header missing" }));

    let (status, response) = post(url.as_str(), Some("guess"), &body).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response, json!({ "message": "Authorization header invalid" }));

    let (status, response) =
        post(url.as_str(), Some("secret"), &json!({ "key": factory.key().as_str() })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response, json!({ "message": "JSON payload missing key 'record'" }));

    let (status, _) = post(
        url.as_str(),
        Some("secret"),
        &json!({ "key": "not a key", "record": factory.record(1).build_base64() }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let other = RecordFactory::new(3);
    let (status, _) = post(
        url.as_str(),
        Some("secret"),
        &json!({
            "key": factory.key().as_str(),
            "record": factory
                .record(1)
                .embed_public_key(other.public_key().to_protobuf())
                .build_base64(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(store.puts().is_empty());
}

#[tokio::test]
async fn broadcast_rejects_stale_record() {
    let store = MockStore::new();
    let factory = RecordFactory::new(4);
    store.insert(&factory.key().path(), factory.record(5).build().into());
    let relay = start_relay(test_config(), &store).await;
    let url = relay.server().unwrap().broadcast_url().unwrap();

    let (status, response) = post(
        url.as_str(),
        Some("secret"),
        &json!({ "key": factory.key().as_str(), "record": factory.record(3).build_base64() }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        response,
        json!({ "message": "supplied record is older or has lower sequence number than existing record" })
    );
    assert!(store.puts().is_empty());
}

#[tokio::test]
async fn unknown_route_and_root_page() {
    let store = MockStore::new();
    let relay = start_relay(test_config(), &store).await;
    let address = relay.server().unwrap().http_address();

    let response = reqwest::get(format!("http://{address}/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({ "message": "not found" })
    );

    let response = reqwest::get(format!("http://{address}/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("/broadcast"));
}
