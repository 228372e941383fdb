//! Extractor tests against a stub API
//!
//! Retry behaviour, URL templating and dedup decisions for a single date.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use ratepipe_common::checksum::CanonicalJson;
use ratepipe_ingest::store::FetchMetadata;
use ratepipe_ingest::{DateError, ExtractOutcome, Extractor, InMemoryMetadataStore, MetadataStore, PipelineContext};
use std::sync::Arc;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let h = Harness::start().await;
    let day = date(2024, 4, 2);

    Mock::given(method("GET"))
        .and(path("/history"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&h.server)
        .await;
    mount_day(&h.server, day, rates_payload(&[(day_start_ms(day), 5.0)])).await;

    let pipeline = h.pipeline();
    let outcome = Extractor::new(pipeline.context()).extract(day).await.unwrap();

    assert!(matches!(outcome, ExtractOutcome::Uploaded { replaced: false, .. }));
    assert_eq!(h.server.received_requests().await.unwrap().len(), 2);
    assert_eq!(h.store.upsert_count(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mut h = Harness::start().await;
    h.config.http.retries = 2;
    let day = date(2024, 4, 2);
    mount_status(&h.server, day, 503).await;

    let pipeline = h.pipeline();
    let err = Extractor::new(pipeline.context()).extract(day).await.unwrap_err();

    assert!(matches!(err, DateError::Transport { attempts: 2, .. }));
    assert_eq!(err.date(), day);
    assert_eq!(h.server.received_requests().await.unwrap().len(), 2);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_day_bounds_template() {
    let mut h = Harness::start().await;
    h.config.api.url_template = format!("{}/range?vs_currency=usd&from={{from}}&to={{to}}", h.server.uri());
    let day = date(2024, 3, 10);

    // 2024-03-10T00:00:00Z and 2024-03-11T00:00:00Z
    Mock::given(method("GET"))
        .and(path("/range"))
        .and(query_param("from", "1710028800"))
        .and(query_param("to", "1710115200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rates_payload(&[(1710028800000, 7.0)])))
        .expect(1)
        .mount(&h.server)
        .await;

    let pipeline = h.pipeline();
    let outcome = Extractor::new(pipeline.context()).extract(day).await.unwrap();

    assert!(outcome.wrote_raw());
    assert!(h.raw_path(day).exists());
}

#[tokio::test]
async fn test_key_order_does_not_change_hash() {
    let h = Harness::start().await;
    let day = date(2024, 4, 2);

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"total_volumes":[],"prices":[[1,2.5]]}"#, "application/json"),
        )
        .mount(&h.server)
        .await;

    let seeded = CanonicalJson::from_value(&serde_json::json!({"prices": [[1, 2.5]], "total_volumes": []}))
        .unwrap()
        .hash()
        .to_string();
    let store = Arc::new(InMemoryMetadataStore::with_rows([FetchMetadata {
        file_date: day,
        hash: seeded.clone(),
    }]));
    let dyn_store: Arc<dyn MetadataStore> = store.clone();
    let ctx = PipelineContext::new(h.config.clone(), dyn_store).unwrap();

    let outcome = Extractor::new(&ctx).extract(day).await.unwrap();

    assert_eq!(outcome.hash(), seeded);
    assert!(matches!(outcome, ExtractOutcome::AlreadyUploaded { .. }));
    assert_eq!(store.upsert_count(), 0);
}

#[tokio::test]
async fn test_stale_raw_file_is_rewritten() {
    let h = Harness::start().await;
    let day = date(2024, 4, 2);
    let payload = rates_payload(&[(day_start_ms(day), 9.5)]);
    mount_day(&h.server, day, payload.clone()).await;

    let pipeline = h.pipeline();
    let extractor = Extractor::new(pipeline.context());
    extractor.extract(day).await.unwrap();

    std::fs::write(h.raw_path(day), b"{\"prices\":[]}").unwrap();
    let outcome = extractor.extract(day).await.unwrap();

    assert!(matches!(outcome, ExtractOutcome::AlreadyUploaded { restored_raw: true, .. }));
    assert_eq!(
        std::fs::read(h.raw_path(day)).unwrap(),
        CanonicalJson::from_value(&payload).unwrap().bytes()
    );
    assert_eq!(h.store.upsert_count(), 1);
}
