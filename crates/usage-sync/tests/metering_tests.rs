//! Integration tests for the metering HTTP client.
//!
//! A wiremock server stands in for both metering schemas.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use usage_sync::{
    Credentials, MeteringClient, MeteringError, MeteringSource, RawUsageEntry, SyncConfig,
    VolumeId, VolumeRegistry, VolumeSpec,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> SyncConfig {
    let mut config = SyncConfig::new(Credentials {
        username: "svc-usage".to_string(),
        password: "secret".to_string(),
    });
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.poll_interval = Duration::from_millis(1);
    config
}

fn volumes(server: &MockServer, kind: &str, names: &[&str]) -> Vec<Arc<VolumeSpec>> {
    let doc = json!({
        "meter01": { "url": server.uri(), "kind": kind, "volumes": names }
    });
    VolumeRegistry::from_json(&doc.to_string())
        .unwrap()
        .volumes()
        .to_vec()
}

async fn mount_auth(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_query(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/async/query/"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"query_id": "q1"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/async/query/q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_done": false})))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/async/query/q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_done": true})))
        .mount(server)
        .await;
}

async fn mount_empty_results(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/async/query_result/q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

fn usernames(entries: &[RawUsageEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| match entry {
            RawUsageEntry::Starfish(e) => e.username.clone().unwrap_or_default(),
            RawUsageEntry::QuotaReport(e) => e.owner.clone().unwrap_or_default(),
        })
        .collect()
}

mod starfish_tests {
    use super::*;

    #[tokio::test]
    async fn test_pages_through_query_results() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_query(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/async/query_result/q1"))
            .and(query_param("offset", "0"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"username": "alice", "groupname": "lab_a", "size_sum": 10, "count": 1},
                {"username": "bob", "groupname": "lab_a", "size_sum": 20, "count": 2},
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/async/query_result/q1"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"username": "carol", "groupname": "lab_b", "size_sum": 30, "count": 3},
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config();
        config.page_size = 2;
        let client = MeteringClient::new(&config).unwrap();
        let volume = &volumes(&server, "starfish", &["v1"])[0];

        let entries = client.fetch_all(volume).await.unwrap();
        assert_eq!(usernames(&entries), vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_rejected_credentials_make_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "starfish", &["v1"])[0];

        let err = client.fetch_all(volume).await.unwrap_err();
        assert!(matches!(err, MeteringError::Auth(_)), "got {err:?}");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_is_reused_across_volumes_on_one_server() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/async/query/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"query_id": "q1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/async/query/q1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_done": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/async/query_result/q1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        for volume in volumes(&server, "starfish", &["v1", "v2"]) {
            assert!(client.fetch_all(&volume).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_rejected_token_is_exchanged_again_for_next_volume() {
        let server = MockServer::start().await;
        mount_auth(&server, 2).await;
        Mock::given(method("POST"))
            .and(path("/api/async/query/"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        mount_query(&server).await;
        mount_empty_results(&server).await;

        let client = MeteringClient::new(&config()).unwrap();
        let volumes = volumes(&server, "starfish", &["v1", "v2"]);

        let err = client.fetch_all(&volumes[0]).await.unwrap_err();
        assert!(matches!(err, MeteringError::Auth(_)), "got {err:?}");
        assert!(client.fetch_all(&volumes[1]).await.unwrap().is_empty());

        let auth_calls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/auth/")
            .count();
        assert_eq!(auth_calls, 2);
    }

    #[tokio::test]
    async fn test_slow_token_exchange_does_not_block_other_servers() {
        let slow = MockServer::start().await;
        let fast = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"token": "tok-1"}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&slow)
            .await;
        mount_auth(&fast, 1).await;
        for server in [&slow, &fast] {
            mount_query(server).await;
            mount_empty_results(server).await;
        }

        let doc = json!({
            "fast": { "url": fast.uri(), "volumes": ["v1"] },
            "slow": { "url": slow.uri(), "volumes": ["v1"] }
        });
        let registry = VolumeRegistry::from_json(&doc.to_string()).unwrap();
        let slow_volume = registry.get(&VolumeId::new("slow", "v1")).unwrap();
        let fast_volume = registry.get(&VolumeId::new("fast", "v1")).unwrap();

        let client = MeteringClient::new(&config()).unwrap();
        let started = Instant::now();
        let (slow_entries, fast_elapsed) = tokio::join!(client.fetch_all(&slow_volume), async {
            assert!(client.fetch_all(&fast_volume).await.unwrap().is_empty());
            started.elapsed()
        });

        assert!(slow_entries.unwrap().is_empty());
        assert!(
            fast_elapsed < Duration::from_millis(800),
            "fast server waited {fast_elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_non_array_result_is_protocol_error() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_query(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/async/query_result/q1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "starfish", &["v1"])[0];

        let err = client.fetch_all(volume).await.unwrap_err();
        assert!(matches!(err, MeteringError::Protocol(_)), "got {err:?}");
    }
}

mod quota_report_tests {
    use super::*;

    #[tokio::test]
    async fn test_follows_cursor_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .and(query_param("cursor", "c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{"project": "lab_b", "owner": "carol", "used": "1.5T"}],
                "next_cursor": null
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .and(query_param("volume", "v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    {"project": "lab_a", "owner": "alice", "used": 100},
                    {"project": "lab_a", "owner": "bob", "used": 200}
                ],
                "next_cursor": "c2"
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let entries = client.fetch_all(volume).await.unwrap();
        assert_eq!(usernames(&entries), vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_persistent_503_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let mut config = config();
        config.retry.max_retries = 3;
        let client = MeteringClient::new(&config).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let err = client.fetch_all(volume).await.unwrap_err();
        match err {
            MeteringError::Unavailable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{"project": "lab_a", "owner": "alice", "used": 1}]
            })))
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let entries = client.fetch_all(volume).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_honours_retry_after_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{"project": "lab_a", "owner": "alice", "used": 1}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let started = Instant::now();
        let entries = client.fetch_all(volume).await.unwrap();
        assert_eq!(usernames(&entries), vec!["alice"]);
        // The one-second hint is clamped to max_delay.
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"entries": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let mut config = config();
        config.retry.max_retries = 3;
        config.http_timeout = Duration::from_millis(50);
        let client = MeteringClient::new(&config).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let err = client.fetch_all(volume).await.unwrap_err();
        match err {
            MeteringError::Unavailable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/quotas"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such volume"))
            .expect(1)
            .mount(&server)
            .await;

        let client = MeteringClient::new(&config()).unwrap();
        let volume = &volumes(&server, "quota_report", &["v1"])[0];

        let err = client.fetch_all(volume).await.unwrap_err();
        assert!(matches!(err, MeteringError::Protocol(_)), "got {err:?}");
    }
}
