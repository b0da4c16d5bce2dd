//! Mirror benchmark scenarios against local mirrors with fixed delays.

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use pkgproxy_core::{
    fetch_mirror_list, pick_fastest, BenchmarkConfig, MirrorError, UbuntuProvider, Url,
};

const BODY_BYTES: usize = 4096;

/// Starts a mirror that answers every path after `delay`.
async fn spawn_mirror(delay: Duration) -> Url {
    let app = Router::new().route(
        "/{*path}",
        get(move || async move {
            tokio::time::sleep(delay).await;
            vec![b'x'; BODY_BYTES]
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Url::parse(&format!("http://{}/ubuntu/", addr)).unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn config(timeout: Duration) -> BenchmarkConfig {
    BenchmarkConfig::default()
        .with_attempts(1)
        .with_min_bytes(BODY_BYTES)
        .with_timeout(timeout)
}

#[tokio::test]
async fn fastest_of_first_three_wins() {
    let a = spawn_mirror(Duration::from_millis(400)).await;
    let b = spawn_mirror(Duration::from_millis(250)).await;
    let c = spawn_mirror(Duration::from_millis(20)).await;
    let d = spawn_mirror(Duration::from_secs(30)).await;
    let e = spawn_mirror(Duration::from_secs(30)).await;

    let mirrors = vec![a.clone(), b.clone(), c.clone(), d, e];
    let outcome = pick_fastest(&client(), &mirrors, &config(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(outcome.fastest, c);
    assert!(outcome.complete);
    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.results[0].url, c);
}

#[tokio::test]
async fn all_hung_mirrors_fail_within_budget() {
    let mut mirrors = Vec::new();
    for _ in 0..3 {
        mirrors.push(spawn_mirror(Duration::from_secs(30)).await);
    }

    let started = std::time::Instant::now();
    let err = pick_fastest(&client(), &mirrors, &config(Duration::from_millis(300)))
        .await
        .unwrap_err();

    assert!(matches!(err, MirrorError::NoResults(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn partial_results_use_best_available() {
    let fast = spawn_mirror(Duration::from_millis(10)).await;
    let slower = spawn_mirror(Duration::from_millis(150)).await;
    let hung = spawn_mirror(Duration::from_secs(30)).await;

    let mirrors = vec![hung, slower, fast.clone()];
    let outcome = pick_fastest(&client(), &mirrors, &config(Duration::from_secs(2)))
        .await
        .unwrap();

    assert_eq!(outcome.fastest, fast);
    assert!(!outcome.complete);
    assert_eq!(outcome.results.len(), 2);
}

#[tokio::test]
async fn short_body_does_not_count() {
    let mirror = spawn_mirror(Duration::ZERO).await;
    let config = config(Duration::from_millis(500)).with_min_bytes(BODY_BYTES * 2);

    let err = pick_fastest(&client(), &[mirror], &config).await.unwrap_err();
    assert!(matches!(err, MirrorError::NoResults(_)));
}

#[tokio::test]
async fn fetches_mirror_list_from_registry() {
    let app = Router::new().route(
        "/mirrors.txt",
        get(|| async { "http://one.example/ubuntu/\n\nhttp://two.example/ubuntu/\n" }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mirrors = fetch_mirror_list(&client(), &format!("http://{}/mirrors.txt", addr))
        .await
        .unwrap();

    assert_eq!(mirrors.len(), 2);
    assert_eq!(mirrors[1].host_str(), Some("two.example"));
}

#[tokio::test]
async fn provider_swaps_in_benchmark_winner() {
    let slow = spawn_mirror(Duration::from_millis(300)).await;
    let fast = spawn_mirror(Duration::from_millis(10)).await;

    let provider = UbuntuProvider::new(slow.clone());
    let benchmark = provider.spawn_benchmark(
        client(),
        vec![slow, fast.clone()],
        config(Duration::from_secs(5)),
    );

    let winner = benchmark.await.unwrap().unwrap();
    assert_eq!(winner, fast);
    assert_eq!(provider.mirror(), fast);
}

#[tokio::test]
async fn provider_keeps_placeholder_when_benchmark_fails() {
    let hung = spawn_mirror(Duration::from_secs(30)).await;

    let provider = UbuntuProvider::new(hung.clone());
    let benchmark = provider.spawn_benchmark(
        client(),
        vec![hung.clone()],
        config(Duration::from_millis(200)),
    );

    assert!(benchmark.await.unwrap().is_err());
    assert_eq!(provider.mirror(), hung);
}
