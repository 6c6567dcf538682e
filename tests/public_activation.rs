//! HTTP-level tests for activation/deactivation and the full license
//! lifecycle flow.

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

fn machine_body(fingerprint: &str, machine_id: &str) -> Body {
    Body::from(
        serde_json::json!({
            "machine_fingerprint": fingerprint,
            "machine_id": machine_id,
        })
        .to_string(),
    )
}

fn post(uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn test_activate_success() {
    let (state, _dir) = test_state();
    {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2001", 3, None);
    }
    let app = app(state);

    let response = app
        .oneshot(post(
            "/KW-AAAA-BBBB-CCCC-2001/activate",
            machine_body("fp-a", "mid-a"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["activation_count"], 1);
    assert_eq!(json["max_activations"], 3);
    assert!(json["rate_limit"]["remaining"].as_u64().is_some());
}

#[tokio::test]
async fn test_activate_unknown_key_is_404() {
    let (state, _dir) = test_state();
    let app = app(state);

    let response = app
        .oneshot(post(
            "/KW-XXXX-XXXX-XXXX-XXXX/activate",
            machine_body("fp-a", "mid-a"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "LicenseNotFound");
}

#[tokio::test]
async fn test_activate_suspended_or_expired_is_invalid_state() {
    let (state, _dir) = test_state();
    {
        let conn = state.db.get().unwrap();
        let suspended = create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2002", 3, None);
        queries::suspend_license(&conn, &suspended.id).unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2003", 3, Some(past_timestamp(1)));
    }
    let app = app(state);

    for key in ["KW-AAAA-BBBB-CCCC-2002", "KW-AAAA-BBBB-CCCC-2003"] {
        let response = app
            .clone()
            .oneshot(post(
                &format!("/{}/activate", key),
                machine_body("fp-a", "mid-a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "key {}", key);
        assert_eq!(body_json(response).await["error"], "LicenseInvalidState");
    }
}

#[tokio::test]
async fn test_activate_limit_exceeded() {
    let (state, _dir) = test_state();
    let license_id = {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2004", 1, None).id
    };
    activate_test_machine(&state, &license_id, "fp-a", "mid-a");
    let app = app(state);

    let response = app
        .oneshot(post(
            "/KW-AAAA-BBBB-CCCC-2004/activate",
            machine_body("fp-b", "mid-b"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "ActivationLimitExceeded");
}

#[tokio::test]
async fn test_activate_same_machine_twice_is_idempotent() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2005", 3, None).id
    };
    let app = app(state);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post(
                "/KW-AAAA-BBBB-CCCC-2005/activate",
                machine_body("fp-a", "mid-a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["activation_count"], 1);
    }

    let conn = db.get().unwrap();
    let stored = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(stored.activation_count, 1);
    assert_eq!(queries::list_activations(&conn, &license_id, 50).unwrap().len(), 1);
}

#[tokio::test]
async fn test_deactivate_and_errors() {
    let (state, _dir) = test_state();
    let license_id = {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2006", 3, None).id
    };
    activate_test_machine(&state, &license_id, "fp-a", "mid-a");
    let app = app(state);

    // Deactivating an unknown binding fails
    let response = app
        .clone()
        .oneshot(post(
            "/KW-AAAA-BBBB-CCCC-2006/deactivate",
            machine_body("fp-x", "mid-x"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "ActivationNotFound");

    // Deactivating the real binding succeeds and frees the slot
    let response = app
        .clone()
        .oneshot(post(
            "/KW-AAAA-BBBB-CCCC-2006/deactivate",
            machine_body("fp-a", "mid-a"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["activation_count"], 0);

    // Unknown license is 404
    let response = app
        .oneshot(post(
            "/KW-XXXX-XXXX-XXXX-XXXX/deactivate",
            machine_body("fp-a", "mid-a"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Full lifecycle: two slots fill, the third machine is refused, freeing a
/// slot lets it in.
#[tokio::test]
async fn test_activation_lifecycle_end_to_end() {
    let (state, _dir) = test_state();
    {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2007", 2, None);
    }
    let app = app(state);

    let activate = |fp: &'static str| {
        post(
            "/KW-AAAA-BBBB-CCCC-2007/activate",
            machine_body(fp, "mid-shared"),
        )
    };

    let response = app.clone().oneshot(activate("fp-a")).await.unwrap();
    assert_eq!(body_json(response).await["activation_count"], 1);

    let response = app.clone().oneshot(activate("fp-b")).await.unwrap();
    assert_eq!(body_json(response).await["activation_count"], 2);

    let response = app.clone().oneshot(activate("fp-c")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "ActivationLimitExceeded");

    let response = app
        .clone()
        .oneshot(post(
            "/KW-AAAA-BBBB-CCCC-2007/deactivate",
            machine_body("fp-a", "mid-shared"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(activate("fp-c")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["activation_count"], 2);
}

#[tokio::test]
async fn test_status_endpoint_masks_everything() {
    let (state, _dir) = test_state();
    let license_id = {
        let conn = state.db.get().unwrap();
        create_test_license(&conn, "KW-AAAA-BBBB-CCCC-2008", 3, Some(future_timestamp(30))).id
    };
    activate_test_machine(&state, &license_id, "fp-a", "mid-a");
    let app = app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/KW-AAAA-BBBB-CCCC-2008/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "active");
    assert_eq!(json["expired"], false);
    assert_eq!(json["activation_count"], 1);
    assert_eq!(json["max_activations"], 3);
    assert_eq!(json["activations"].as_array().unwrap().len(), 1);
    assert_eq!(json["activations"][0]["active"], true);

    // The raw key never appears anywhere in the response
    let raw = json.to_string();
    assert!(!raw.contains("KW-AAAA-BBBB-CCCC-2008"));
    assert_eq!(json["license_key"], "KW-A****2008");

    // Unknown key is 404
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/KW-XXXX-XXXX-XXXX-XXXX/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
