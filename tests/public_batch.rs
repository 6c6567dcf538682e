//! Batch endpoint tests: size limits, independent per-line processing, and
//! masked key echoes.

mod common;
use common::*;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn batch_request(operations: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/licenses/batch")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "operations": operations }).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let (state, _dir) = test_state();
    let app = app(state);

    let response = app
        .oneshot(batch_request(serde_json::json!([])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "ValidationError");
}

/// Eleven operations must be rejected up front - no operation executes.
#[tokio::test]
async fn test_oversized_batch_rejected_before_execution() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-3001", 10, None).id
    };
    let app = app(state);

    let ops: Vec<serde_json::Value> = (0..11)
        .map(|i| {
            serde_json::json!({
                "type": "activate",
                "license_key": "KW-AAAA-BBBB-CCCC-3001",
                "machine_fingerprint": format!("fp-{}", i),
                "machine_id": format!("mid-{}", i),
            })
        })
        .collect();

    let response = app
        .oneshot(batch_request(serde_json::json!(ops)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing ran: no activations were created
    let conn = db.get().unwrap();
    assert_eq!(queries::list_activations(&conn, &license_id, 50).unwrap().len(), 0);
}

#[tokio::test]
async fn test_batch_mixed_results_are_independent() {
    let (state, _dir) = test_state();
    {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-3002", 3, None);
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-3003", 3, Some(past_timestamp(1)));
    }
    let app = app(state);

    let response = app
        .oneshot(batch_request(serde_json::json!([
            { "type": "validate", "license_key": "KW-AAAA-BBBB-CCCC-3002" },
            { "type": "validate", "license_key": "KW-AAAA-BBBB-CCCC-3003" },
            { "type": "validate", "license_key": "KW-ZZZZ-ZZZZ-ZZZZ-ZZZZ" },
            { "type": "activate", "license_key": "KW-AAAA-BBBB-CCCC-3002",
              "machine_fingerprint": "fp-a", "machine_id": "mid-a" },
            { "type": "activate", "license_key": "KW-AAAA-BBBB-CCCC-3002" },
        ])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["operations_count"], 5);
    assert!(json["batch_id"].as_str().unwrap().starts_with("kw_bat_"));

    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 5);

    assert_eq!(results[0]["success"], true);

    assert_eq!(results[1]["success"], false);
    assert_eq!(results[1]["error"], "LicenseExpired");

    assert_eq!(results[2]["success"], false);
    assert_eq!(results[2]["error"], "LicenseNotFound");

    // A failing line does not stop later lines from running
    assert_eq!(results[3]["success"], true);

    // Activate without machine data is a per-line validation error
    assert_eq!(results[4]["success"], false);
    assert_eq!(results[4]["error"], "ValidationError");
}

#[tokio::test]
async fn test_batch_echoes_only_masked_keys() {
    let (state, _dir) = test_state();
    {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-3004", 3, None);
    }
    let app = app(state);

    let response = app
        .oneshot(batch_request(serde_json::json!([
            { "type": "validate", "license_key": "KW-AAAA-BBBB-CCCC-3004" },
        ])))
        .await
        .unwrap();

    let json = body_json(response).await;
    assert!(!json.to_string().contains("KW-AAAA-BBBB-CCCC-3004"));
    assert_eq!(json["results"][0]["license_key"], "KW-A****3004");
}
