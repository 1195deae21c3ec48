//! Integration tests for the etcd adapter, the registration agent, and the
//! discovery client against a real etcd container.
//!
//! Requires Docker (via testcontainers); fails fast at container startup in
//! environments without it.
//!
//! Run with: `cargo test --test etcd_integration`

use std::sync::Arc;
use std::time::Duration;

use hermes_mesh::config::{DiscoveryConfig, EtcdConfig, RegistrationConfig};
use hermes_mesh::discovery::DiscoveryClient;
use hermes_mesh::etcd::client::{b64_decode, b64_encode, PutRequest, RangeRequest};
use hermes_mesh::etcd::EtcdClient;
use hermes_mesh::registration::{NoopHost, RegistrationAgent};

use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

async fn start_etcd() -> (EtcdClient, EtcdConfig, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("quay.io/coreos/etcd", "v3.5.17")
        .with_exposed_port(2379_u16.tcp())
        .with_env_var("ETCD_ADVERTISE_CLIENT_URLS", "http://0.0.0.0:2379")
        .with_env_var("ETCD_LISTEN_CLIENT_URLS", "http://0.0.0.0:2379")
        .start()
        .await
        .expect("failed to start etcd container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(2379).await.expect("get port");
    let endpoint = format!("http://{}:{}", host, port);

    let http = reqwest::Client::new();
    for _ in 0..30 {
        if let Ok(resp) = http
            .post(format!("{}/v3/maintenance/status", endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await
        {
            if resp.status().is_success() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let etcd_cfg = EtcdConfig {
        endpoints: vec![endpoint],
        username: None,
        password: None,
    };

    let client = EtcdClient::connect(&etcd_cfg).await.expect("connect to etcd");
    (client, etcd_cfg, container)
}

// ── EtcdClient low-level tests ──────────────────────

#[tokio::test]
async fn test_etcd_put_and_range() {
    let (client, _cfg, _container) = start_etcd().await;

    client
        .put(&PutRequest {
            key: b64_encode("/test/key1"),
            value: b64_encode("hello"),
            lease: None,
        })
        .await
        .expect("put");

    let resp = client
        .range(&RangeRequest {
            key: b64_encode("/test/key1"),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .expect("range");

    assert_eq!(resp.kvs.len(), 1);
    let val = b64_decode(&resp.kvs[0].value).unwrap();
    assert_eq!(val, "hello");
}

#[tokio::test]
async fn test_etcd_range_prefix() {
    let (client, _cfg, _container) = start_etcd().await;

    for i in 0..3 {
        client
            .put(&PutRequest {
                key: b64_encode(&format!("/prefix/key{}", i)),
                value: b64_encode(&format!("val{}", i)),
                lease: None,
            })
            .await
            .expect("put");
    }

    let resp = client.get_prefix("/prefix/").await.expect("range prefix");
    assert_eq!(resp.kvs.len(), 3);
}

#[tokio::test]
async fn test_etcd_lease_grant_keepalive_and_revoke() {
    let (client, _cfg, _container) = start_etcd().await;

    let lease_id = client.lease_grant(30).await.expect("lease grant");
    assert!(lease_id > 0);

    client.lease_keepalive(lease_id).await.expect("lease keepalive");

    client
        .put(&PutRequest {
            key: b64_encode("/leased/key"),
            value: b64_encode("leased-value"),
            lease: Some(lease_id),
        })
        .await
        .expect("put with lease");

    let resp = client
        .range(&RangeRequest {
            key: b64_encode("/leased/key"),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .expect("range");
    assert_eq!(resp.kvs.len(), 1);

    client.lease_revoke(lease_id).await.expect("lease revoke");

    let resp = client
        .range(&RangeRequest {
            key: b64_encode("/leased/key"),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .expect("range after revoke");
    assert_eq!(resp.kvs.len(), 0, "key should be gone after lease revoke");
}

#[tokio::test]
async fn test_etcd_delete() {
    let (client, _cfg, _container) = start_etcd().await;

    client
        .put(&PutRequest {
            key: b64_encode("/deleteme"),
            value: b64_encode("x"),
            lease: None,
        })
        .await
        .unwrap();

    client.delete("/deleteme").await.expect("delete");

    let resp = client
        .range(&RangeRequest {
            key: b64_encode("/deleteme"),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .expect("range");
    assert_eq!(resp.kvs.len(), 0);
}

#[tokio::test]
async fn test_etcd_watch_stream() {
    let (client, _cfg, _container) = start_etcd().await;

    use hermes_mesh::etcd::client::{prefix_range_end, WatchCreate, WatchCreateRequest};

    let watch_client = client.clone();
    let watch_handle = tokio::spawn(async move {
        let mut stream = watch_client
            .watch_stream(&WatchCreateRequest {
                create_request: WatchCreate {
                    key: b64_encode("/watch/"),
                    range_end: prefix_range_end("/watch/"),
                    start_revision: None,
                },
            })
            .await
            .expect("watch stream");

        let mut keys = Vec::new();
        for _ in 0..2 {
            if let Some(resp) = stream.next_response().await {
                if let Some(result) = resp.result {
                    for event in &result.events {
                        if let Some(kv) = &event.kv {
                            if let Ok(k) = b64_decode(&kv.key) {
                                keys.push(k);
                            }
                        }
                    }
                }
                if keys.len() >= 2 {
                    break;
                }
            }
        }
        keys
    });

    tokio::time::sleep(Duration::from_millis(500)).await;

    client
        .put(&PutRequest {
            key: b64_encode("/watch/a"),
            value: b64_encode("1"),
            lease: None,
        })
        .await
        .unwrap();
    client
        .put(&PutRequest {
            key: b64_encode("/watch/b"),
            value: b64_encode("2"),
            lease: None,
        })
        .await
        .unwrap();

    let keys = tokio::time::timeout(Duration::from_secs(10), watch_handle)
        .await
        .expect("watch timed out")
        .expect("watch task panicked");
    assert_eq!(keys.len(), 2);
}

// ── Registration agent scenarios ──────────────────────────────────

fn registration_config(service_name: &str) -> RegistrationConfig {
    let mut cfg = RegistrationConfig::default();
    cfg.namespace = "it".to_string();
    cfg.service_name = service_name.to_string();
    cfg.address = "10.0.0.1:9000".to_string();
    cfg.lease_ttl_secs = 10;
    cfg
}

/// Scenario #1: force-delete the agent's key externally; the agent revokes
/// its dead lease, mints a new one, and re-publishes under the same key.
#[tokio::test]
async fn test_agent_republishes_after_external_delete() {
    let (client, _cfg, _container) = start_etcd().await;

    let agent = RegistrationAgent::new(client.clone(), registration_config("u"), Arc::new(NoopHost));
    agent.start().await.expect("agent start");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let key = agent.key().to_string();
    let resp = client
        .range(&RangeRequest {
            key: b64_encode(&key),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.kvs.len(), 1, "key should be published after start");
    let original_value = b64_decode(&resp.kvs[0].value).unwrap();

    // Force-delete the key externally (not via agent.close()).
    client.delete(&key).await.expect("external delete");

    // The watcher should notice the delete and re-publish within ~1s.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let resp = client
        .range(&RangeRequest {
            key: b64_encode(&key),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.kvs.len(), 1, "key should be re-published after external delete");
    let republished_value = b64_decode(&resp.kvs[0].value).unwrap();
    assert_eq!(republished_value, original_value);

    agent.close().await;

    // After a caller-initiated close, the key must stay gone.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let resp = client
        .range(&RangeRequest {
            key: b64_encode(&key),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.kvs.len(), 0, "close() must leave no lease and no key behind");
}

/// Scenario: an instance observed with `status=Kill` deletes its own key and
/// stops — exercised by publishing a Kill record directly on the agent's key.
#[tokio::test]
async fn test_agent_self_deletes_on_observed_kill_status() {
    let (client, _cfg, _container) = start_etcd().await;

    let agent = RegistrationAgent::new(client.clone(), registration_config("v"), Arc::new(NoopHost));
    agent.start().await.expect("agent start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let key = agent.key().to_string();
    let mut record = hermes_mesh::registration::InstanceRecord::new(
        "it",
        hermes_mesh::config::ServiceType::Rpc,
        "v",
        "10.0.0.1:9000",
    );
    record.status = hermes_mesh::config::InstanceStatus::Kill;

    client
        .put(&PutRequest {
            key: b64_encode(&key),
            value: b64_encode(&record.encode().unwrap()),
            lease: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let resp = client
        .range(&RangeRequest {
            key: b64_encode(&key),
            range_end: String::new(),
            keys_only: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.kvs.len(), 0, "observed status=Kill must delete the self key");
}

// ── Discovery client ──────────────────────

/// Seeds two instances under a namespace prefix before the discovery client
/// starts, then applies a live Put and Delete via the watch stream.
#[tokio::test]
async fn test_discovery_bootstraps_and_applies_watch_events() {
    let (client, _cfg, _container) = start_etcd().await;

    let ns = "discoveryit";
    let put_instance = |key: &'static str, inst: &'static str, addr: &'static str| {
        let client = client.clone();
        async move {
            let record = hermes_mesh::registration::InstanceRecord::new(
                ns,
                hermes_mesh::config::ServiceType::Rpc,
                key,
                addr,
            );
            client
                .put(&PutRequest {
                    key: b64_encode(&format!("/{ns}/rpc/{key}/{inst}")),
                    value: b64_encode(&record.encode().unwrap()),
                    lease: None,
                })
                .await
                .unwrap();
        }
    };

    put_instance("u", "seed1", "10.0.0.1:1").await;

    let discovery_cfg = DiscoveryConfig {
        namespace: ns.to_string(),
        default_balancer: hermes_mesh::config::BalancerKind::RoundRobin,
        balancer_overrides: Default::default(),
        use_isolate: false,
    };
    let discovery = DiscoveryClient::new(client.clone(), &discovery_cfg);
    discovery.start().await.expect("discovery start");

    assert_eq!(discovery.get_service_count("u"), 1, "seeded instance should be visible immediately");

    put_instance("u", "live1", "10.0.0.1:2").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(discovery.get_service_count("u"), 2, "live Put should be applied");

    client
        .delete(&format!("/{ns}/rpc/u/seed1"))
        .await
        .expect("delete seed instance");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(discovery.get_service_count("u"), 1, "live Delete should be applied");

    let selected = discovery.select_service("u").expect("select");
    assert_eq!(selected.key, "u");

    discovery.close();
}

/// Scenario #6: `WaitForService` times out for a name with no instances.
#[tokio::test]
async fn test_wait_for_service_times_out() {
    let (client, _cfg, _container) = start_etcd().await;

    let discovery_cfg = DiscoveryConfig {
        namespace: "waitit".to_string(),
        default_balancer: hermes_mesh::config::BalancerKind::RoundRobin,
        balancer_overrides: Default::default(),
        use_isolate: false,
    };
    let discovery = DiscoveryClient::new(client, &discovery_cfg);
    discovery.start().await.expect("discovery start");

    let start = tokio::time::Instant::now();
    let result = discovery.wait_for_service("absent", Duration::from_millis(500)).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(hermes_mesh::error::MeshError::Timeout)));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed <= Duration::from_millis(900));
}
