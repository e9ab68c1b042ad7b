//! etcd v2 adapter tests against a mocked keys API

use discovery::store::{SetOptions, WatchAction};
use discovery::{CoordinationStore, DiscoveryConfig, DiscoveryError, EtcdStore};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(nodes: Vec<String>) -> DiscoveryConfig {
    DiscoveryConfig {
        store_nodes: nodes,
        header_timeout: 2,
        ..Default::default()
    }
}

async fn etcd_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"etcdserver": "2.3.8", "etcdcluster": "2.3.0"})),
        )
        .mount(&server)
        .await;
    server
}

fn not_found(key: &str) -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(json!({
        "errorCode": 100,
        "message": "Key not found",
        "cause": key,
        "index": 42
    }))
}

#[tokio::test]
async fn test_connect_fails_when_no_endpoint_answers() {
    let result = EtcdStore::connect(&config_for(vec!["http://127.0.0.1:1".to_string()])).await;
    assert!(matches!(result, Err(DiscoveryError::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_connect_skips_dead_endpoint() {
    let server = etcd_server().await;
    let store = EtcdStore::connect(&config_for(vec![
        "http://127.0.0.1:1".to_string(),
        server.uri(),
    ]))
    .await
    .unwrap();

    assert_eq!(store.active_endpoint(), server.uri());
    let health = store.health_check().await.unwrap();
    assert!(health.healthy);
}

#[tokio::test]
async fn test_recursive_get() {
    let server = etcd_server().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/etcDiscovery/"))
        .and(query_param("recursive", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Etcd-Index", "17")
                .set_body_json(json!({
                    "action": "get",
                    "node": {
                        "key": "/etcDiscovery",
                        "dir": true,
                        "nodes": [{
                            "key": "/etcDiscovery/client1",
                            "value": "{\"name\":\"client1\",\"address\":\"10.0.0.1:9000\"}",
                            "expiration": "2016-01-01T00:00:00Z",
                            "ttl": 97,
                            "modifiedIndex": 15,
                            "createdIndex": 12
                        }],
                        "modifiedIndex": 3,
                        "createdIndex": 3
                    }
                })),
        )
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    let snapshot = store.get("/etcDiscovery/", true).await.unwrap();

    assert_eq!(snapshot.index, 17);
    assert!(snapshot.node.dir);
    assert_eq!(snapshot.node.nodes.len(), 1);
    assert_eq!(snapshot.node.nodes[0].ttl, Some(97));
    assert_eq!(snapshot.node.nodes[0].created_index, 12);
}

#[tokio::test]
async fn test_missing_key() {
    let server = etcd_server().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/etcDiscovery/client9"))
        .respond_with(not_found("/etcDiscovery/client9"))
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    let err = store.get("/etcDiscovery/client9", false).await.unwrap_err();
    assert!(err.is_key_not_found());
    assert_eq!(err.store_index(), Some(42));
}

#[tokio::test]
async fn test_create_with_ttl() {
    let server = etcd_server().await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/etcDiscovery/client1"))
        .and(body_string_contains("ttl=100"))
        .and(body_string_contains("value="))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "action": "set",
            "node": {
                "key": "/etcDiscovery/client1",
                "value": "{}",
                "ttl": 100,
                "modifiedIndex": 20,
                "createdIndex": 20
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    let node = store
        .set(
            "/etcDiscovery/client1",
            "{}",
            SetOptions::with_ttl(Duration::from_secs(100)),
        )
        .await
        .unwrap();
    assert_eq!(node.modified_index, 20);
}

#[tokio::test]
async fn test_refresh_sends_refresh_flags() {
    let server = etcd_server().await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/etcDiscovery/client1"))
        .and(body_string_contains("refresh=true"))
        .and(body_string_contains("prevExist=true"))
        .and(body_string_contains("ttl=100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "update",
            "node": {
                "key": "/etcDiscovery/client1",
                "value": "{}",
                "ttl": 100,
                "modifiedIndex": 21,
                "createdIndex": 20
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    store
        .set(
            "/etcDiscovery/client1",
            "",
            SetOptions::refresh(Duration::from_secs(100)),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rejected_write() {
    let server = etcd_server().await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/etcDiscovery/client1"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errorCode": 212,
            "message": "A TTL must be provided",
            "index": 21
        })))
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    let options = SetOptions {
        refresh: true,
        ..Default::default()
    };
    match store.set("/etcDiscovery/client1", "", options).await {
        Err(DiscoveryError::StoreRejected { code, .. }) => assert_eq!(code, 212),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_recursive_delete() {
    let server = etcd_server().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/keys/etcDiscovery/client1"))
        .and(query_param("recursive", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "delete",
            "node": {"key": "/etcDiscovery/client1", "modifiedIndex": 22, "createdIndex": 20},
            "prevNode": {"key": "/etcDiscovery/client1", "value": "{}", "modifiedIndex": 21, "createdIndex": 20}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    store.delete("/etcDiscovery/client1", true).await.unwrap();
}

#[tokio::test]
async fn test_watch_follows_wait_index_until_cleared() {
    let server = etcd_server().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/etcDiscovery/"))
        .and(query_param("wait", "true"))
        .and(query_param("waitIndex", "18"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "set",
            "node": {
                "key": "/etcDiscovery/client2",
                "value": "{\"name\":\"client2\",\"address\":\"10.0.0.2:9000\"}",
                "modifiedIndex": 19,
                "createdIndex": 19
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/etcDiscovery/"))
        .and(query_param("wait", "true"))
        .and(query_param("waitIndex", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "expire",
            "node": {"key": "/etcDiscovery/client1", "modifiedIndex": 20, "createdIndex": 12},
            "prevNode": {"key": "/etcDiscovery/client1", "value": "{}", "modifiedIndex": 15, "createdIndex": 12}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/etcDiscovery/"))
        .and(query_param("wait", "true"))
        .and(query_param("waitIndex", "21"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errorCode": 401,
            "message": "The event in requested index is outdated and cleared",
            "cause": "the requested history has been cleared [1018/21]",
            "index": 2017
        })))
        .mount(&server)
        .await;

    let store = EtcdStore::connect(&config_for(vec![server.uri()])).await.unwrap();
    let mut events = store.watch("/etcDiscovery/", true, Some(17)).await.unwrap();

    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.action, WatchAction::Set);
    assert_eq!(first.node.key, "/etcDiscovery/client2");

    let second = events.next().await.unwrap().unwrap();
    assert_eq!(second.action, WatchAction::Expire);
    assert_eq!(second.prev_node.unwrap().value_str(), "{}");

    let third = events.next().await.unwrap();
    assert!(matches!(third, Err(DiscoveryError::Watch(_))));
    assert!(events.next().await.is_none());
}
