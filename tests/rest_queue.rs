mod support;

use std::time::Duration;

use shardgate::config::RestConfig;
use shardgate::rest::{route_key, RequestMethod, RestManager, RestResponse};
use shardgate::RestError;
use support::{ok_with_limit, rate_limited, MockTransport};
use tokio::time::{sleep, Instant};

fn rest_config() -> RestConfig {
    RestConfig {
        base_url: "http://api.test".to_string(),
        ..RestConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_holds_next_request_until_reset() {
    let transport = MockTransport::new(|_, call| {
        Ok(if call == 0 {
            ok_with_limit(0, 2.0)
        } else {
            ok_with_limit(4, 2.0)
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());

    manager.get("/channels/1/messages").await.unwrap();
    manager.get("/channels/1/messages").await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at - sent[0].at >= Duration::from_secs(2));
    assert_eq!(sent[0].url, "http://api.test/v10/channels/1/messages");
}

#[tokio::test(start_paused = true)]
async fn other_routes_are_not_held_by_an_exhausted_bucket() {
    let transport = MockTransport::new(|_, _| Ok(ok_with_limit(0, 30.0)));
    let manager = RestManager::new(rest_config(), transport.clone());

    let start = Instant::now();
    manager.get("/channels/1/messages").await.unwrap();
    manager.get("/channels/2/messages").await.unwrap();
    manager.get("/guilds/3").await.unwrap();
    assert!(Instant::now() - start < Duration::from_secs(1));
    assert_eq!(manager.queue_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn requests_on_one_route_are_sent_in_submission_order() {
    let transport =
        MockTransport::with_latency(Duration::from_millis(100), |_, _| Ok(ok_with_limit(10, 60.0)));
    let manager = RestManager::new(rest_config(), transport.clone());

    let mut handles = Vec::new();
    for n in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .get(&format!("/channels/1/messages?before={n}"))
                .await
        }));
        sleep(Duration::from_millis(1)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let urls: Vec<String> = transport.sent().into_iter().map(|s| s.url).collect();
    let expected: Vec<String> = (0..5)
        .map(|n| format!("http://api.test/v10/channels/1/messages?before={n}"))
        .collect();
    assert_eq!(urls, expected);
}

#[tokio::test(start_paused = true)]
async fn unknown_limit_allows_a_single_request_in_flight() {
    let transport =
        MockTransport::with_latency(Duration::from_millis(100), |_, _| Ok(ok_with_limit(5, 10.0)));
    let manager = RestManager::new(rest_config(), transport.clone());
    let route = route_key(RequestMethod::Get, "/users/@me");

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.get("/users/@me").await }));
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.in_flight(&route), 1);
    assert_eq!(manager.queue_len(&route), 2);

    // Once the limit is known the remaining two go out together.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.in_flight(&route), 2);
    assert_eq!(manager.queue_len(&route), 0);

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(transport.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_request_is_retried_after_delay() {
    let transport = MockTransport::new(|_, call| {
        Ok(if call == 0 {
            rate_limited(1.5, false)
        } else {
            ok_with_limit(3, 5.0).with_body(r#"{"id":"9"}"#)
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());

    let response = manager
        .post("/channels/1/messages", Some(serde_json::json!({ "content": "hi" })))
        .await
        .unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], "9");

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at - sent[0].at >= Duration::from_millis(1_500));
    assert_eq!(manager.invalid_request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_max_retry_count() {
    let transport = MockTransport::new(|_, _| Ok(rate_limited(0.1, false)));
    let config = RestConfig {
        max_retry_count: Some(2),
        ..rest_config()
    };
    let manager = RestManager::new(config, transport.clone());

    let err = manager.delete("/channels/1/messages/2").await.unwrap_err();
    assert!(matches!(
        err,
        RestError::RetriesExhausted {
            method: RequestMethod::Delete,
            retries: 2,
            ..
        }
    ));
    assert_eq!(err.status(), Some(429));
    assert_eq!(transport.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn global_limit_holds_every_route() {
    let transport = MockTransport::new(|request, call| {
        Ok(if call == 0 && request.url.ends_with("/gateway") {
            rate_limited(3.0, true)
        } else {
            RestResponse::new(200)
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());

    let start = Instant::now();
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get("/gateway").await })
    };
    sleep(Duration::from_millis(10)).await;
    assert!(manager.is_globally_limited());

    manager.get("/users/@me").await.unwrap();
    first.await.unwrap().unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[1].at - start >= Duration::from_secs(3));
    assert!(sent[2].at - start >= Duration::from_secs(3));
    assert!(!manager.is_globally_limited());
}

#[tokio::test(start_paused = true)]
async fn shared_bucket_label_merges_route_state() {
    let transport = MockTransport::new(|request, _| {
        let remaining = if request.url.ends_with("/messages") { 1 } else { 0 };
        Ok(ok_with_limit(remaining, 5.0).with_header("x-ratelimit-bucket", "b-messages"))
    });
    let manager = RestManager::new(rest_config(), transport.clone());
    let list = route_key(RequestMethod::Get, "/channels/123/messages");
    let single = route_key(RequestMethod::Get, "/channels/123/messages/456");
    assert_ne!(list, single);

    let start = Instant::now();
    manager.get("/channels/123/messages").await.unwrap();
    manager.get("/channels/123/messages/456").await.unwrap();
    assert_eq!(manager.bucket_id(&list).as_deref(), Some("b-messages"));
    assert_eq!(manager.bucket_id(&single).as_deref(), Some("b-messages"));

    // The second route spent the shared window, so the first waits too.
    manager.get("/channels/123/messages").await.unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[1].at - start < Duration::from_secs(1));
    assert!(sent[2].at - start >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn error_statuses_reject_without_retry() {
    let transport = MockTransport::new(|request, _| {
        Ok(if request.url.ends_with("/missing") {
            RestResponse::new(404).with_body(r#"{"message":"Unknown Channel","code":10003}"#)
        } else {
            RestResponse::new(502)
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());

    let err = manager.get("/channels/1/missing").await.unwrap_err();
    match err {
        RestError::Http { status, body, .. } => {
            assert_eq!(status, 404);
            assert!(body.unwrap().contains("Unknown Channel"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let err = manager.patch("/guilds/1", None).await.unwrap_err();
    assert_eq!(err.status(), Some(502));
    assert_eq!(transport.count(), 2);
    assert_eq!(manager.invalid_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_request_breaker_halts_all_admission() {
    let transport = MockTransport::new(|request, _| {
        Ok(if request.url.ends_with("/forbidden") {
            RestResponse::new(403)
        } else {
            RestResponse::new(200)
        })
    });
    let config = RestConfig {
        invalid_request_max: 3,
        invalid_request_interval_ms: 10_000,
        invalid_request_safety_margin: 1,
        ..rest_config()
    };
    let manager = RestManager::new(config, transport.clone());

    let start = Instant::now();
    for _ in 0..2 {
        let err = manager.get("/guilds/1/forbidden").await.unwrap_err();
        assert_eq!(err.status(), Some(403));
    }
    assert_eq!(manager.invalid_request_count(), 2);

    manager.get("/users/@me").await.unwrap();
    let sent = transport.sent();
    assert!(sent[2].at - start >= Duration::from_secs(10));
    assert_eq!(manager.invalid_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shared_scope_rate_limits_are_not_counted_as_invalid() {
    let transport = MockTransport::new(|_, call| {
        Ok(if call == 0 {
            rate_limited(0.5, false).with_header("x-ratelimit-scope", "shared")
        } else {
            RestResponse::new(204)
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());

    let response = manager
        .put("/channels/1/messages/2/reactions/%F0%9F%91%8D/@me", None)
        .await
        .unwrap();
    assert_eq!(response.status, 204);
    assert_eq!(transport.count(), 2);
    assert_eq!(manager.invalid_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_queues_are_removed_after_delay() {
    let transport = MockTransport::new(|_, _| Ok(RestResponse::new(200)));
    let config = RestConfig {
        delete_queue_delay_ms: 1_000,
        ..rest_config()
    };
    let manager = RestManager::new(config, transport.clone());

    manager.get("/channels/1/messages").await.unwrap();
    manager.get("/channels/2/messages").await.unwrap();
    assert_eq!(manager.queue_count(), 2);

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(manager.queue_count(), 0);

    manager.get("/channels/1/messages").await.unwrap();
    assert_eq!(manager.queue_count(), 1);
    assert_eq!(transport.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_rejects_caller() {
    let transport = MockTransport::new(|_, _| anyhow::bail!("connection reset"));
    let manager = RestManager::new(rest_config(), transport.clone());

    let err = manager.get("/gateway/bot").await.unwrap_err();
    assert!(matches!(err, RestError::Transport { .. }));
    assert_eq!(err.status(), None);
}

#[tokio::test(start_paused = true)]
async fn unrepresentable_reset_headers_do_not_stall_the_route() {
    let transport = MockTransport::new(|_, call| {
        Ok(match call {
            0 => RestResponse::new(200)
                .with_header("x-ratelimit-remaining", "0")
                .with_header("x-ratelimit-reset-after", "1e20"),
            1 => rate_limited(1e20, false),
            _ => RestResponse::new(200),
        })
    });
    let manager = RestManager::new(rest_config(), transport.clone());
    let route = route_key(RequestMethod::Get, "/channels/1/pins");

    manager.get("/channels/1/pins").await.unwrap();
    manager.get("/channels/1/pins").await.unwrap();
    assert_eq!(manager.in_flight(&route), 0);

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    // The oversized retry hint falls back to the configured default.
    let retried_after = sent[2].at - sent[1].at;
    assert!(retried_after >= manager.config().default_retry_after());
    assert!(retried_after < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn panicking_transport_releases_the_in_flight_slot() {
    let transport = MockTransport::new(|_, call| {
        if call == 0 {
            panic!("transport bug");
        }
        Ok(ok_with_limit(5, 1.0))
    });
    let manager = RestManager::new(rest_config(), transport.clone());
    let route = route_key(RequestMethod::Get, "/users/@me");

    let err = manager.get("/users/@me").await.unwrap_err();
    assert!(matches!(err, RestError::Dropped));
    sleep(Duration::from_millis(1)).await;
    assert_eq!(manager.in_flight(&route), 0);

    manager.get("/users/@me").await.unwrap();
    assert_eq!(transport.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn retired_routes_release_shared_bucket_aliases() {
    let transport = MockTransport::new(|_, _| {
        Ok(ok_with_limit(5, 0.5).with_header("x-ratelimit-bucket", "b-guild"))
    });
    let config = RestConfig {
        delete_queue_delay_ms: 1_000,
        ..rest_config()
    };
    let manager = RestManager::new(config, transport.clone());

    for guild_id in 0..50 {
        manager.get(&format!("/guilds/{guild_id}")).await.unwrap();
    }
    assert_eq!(manager.queue_count(), 50);
    assert_eq!(manager.shared_bucket_routes(), 50);

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(manager.queue_count(), 0);
    assert_eq!(manager.shared_bucket_routes(), 0);

    manager.get("/guilds/7").await.unwrap();
    assert_eq!(manager.shared_bucket_routes(), 1);
}
