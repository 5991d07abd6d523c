//! BackendClient against an in-process axum backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use passportbuddy::config::BackendConfig;
use passportbuddy::queue::ManualClock;
use passportbuddy::{BackendClient, ErrorKind, LikeStatus, Notice, QueueConfig, RequestQueue};

/// Retry quickly so tests do not sit in multi-second backoffs.
fn fast_queue() -> QueueConfig {
    QueueConfig {
        base_retry_delay_ms: 10,
        ..QueueConfig::default()
    }
}

async fn spawn_backend(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base_url: String, queue: RequestQueue) -> BackendClient {
    let config = BackendConfig {
        base_url,
        timeout_sec: 5,
    };
    BackendClient::new(&config, queue).unwrap()
}

/// Fails with 503 for the first `failures` hits, then toggles.
fn flaky_router(hits: Arc<AtomicU32>, failures: u32) -> Router {
    Router::new()
        .route(
            "/api/posts/{id}/like",
            post(
                move |State(hits): State<Arc<AtomicU32>>, Path(_id): Path<String>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= failures {
                        return Err(StatusCode::SERVICE_UNAVAILABLE);
                    }
                    Ok(Json(LikeStatus {
                        liked: n % 2 == 1,
                        likes: u64::from(n),
                    }))
                },
            ),
        )
        .with_state(hits)
}

fn status_router(hits: Arc<AtomicU32>, status: StatusCode) -> Router {
    Router::new()
        .route(
            "/api/posts/{id}/like",
            post(move |State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                status
            }),
        )
        .with_state(hits)
}

#[tokio::test]
async fn test_toggle_like_succeeds() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_backend(flaky_router(hits.clone(), 0)).await;
    let client = client(base, RequestQueue::new(fast_queue()));

    let status = client.toggle_like("64f0c2").await.unwrap();
    assert_eq!(status, LikeStatus { liked: true, likes: 1 });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_backend(flaky_router(hits.clone(), 2)).await;
    let client = client(base, RequestQueue::new(fast_queue()));

    let status = client.toggle_like("64f0c2").await.unwrap();
    assert_eq!(status.likes, 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(client.queue().stats().retried, 2);
}

#[tokio::test]
async fn test_persistent_server_error_exhausts_retries() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_backend(status_router(hits.clone(), StatusCode::INTERNAL_SERVER_ERROR)).await;
    let client = client(base, RequestQueue::new(fast_queue()));

    let err = client.toggle_like("64f0c2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.attempts(), Some(4));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(Notice::for_error(&err), Notice::Failed);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_backend(status_router(hits.clone(), StatusCode::NOT_FOUND)).await;
    let client = client(base, RequestQueue::new(fast_queue()));

    let err = client.toggle_like("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(err.attempts(), Some(1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_backend_is_transient() {
    // Nothing listens on the discard port.
    let client = client("http://127.0.0.1:9".to_string(), RequestQueue::new(fast_queue()));

    let err = client.toggle_like("64f0c2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.attempts(), Some(4));
}

#[tokio::test]
async fn test_like_burst_is_rate_limited_per_post() {
    let hits = Arc::new(AtomicU32::new(0));
    let base = spawn_backend(flaky_router(hits.clone(), 0)).await;
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let client = client(base, RequestQueue::with_clock(fast_queue(), clock));

    let handles: Vec<_> = (0..11).map(|_| client.toggle_like("64f0c2")).collect();
    let other_post = client.toggle_like("64f0c3");

    let mut too_fast = 0;
    for handle in handles {
        if let Err(e) = handle.await {
            assert_eq!(e.to_string(), "Rate limit exceeded");
            assert_eq!(Notice::for_error(&e), Notice::TooFast);
            too_fast += 1;
        }
    }
    assert!(other_post.await.is_ok());
    assert_eq!(too_fast, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}
