//! REST control plane regression tests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use klaxon::api::{create_app, ApiState};
use klaxon::dispatch::Dispatcher;
use klaxon::new_filter;
use klaxon::pipeline::Pipeline;

fn state() -> (ApiState, Arc<Pipeline>, Arc<Dispatcher>) {
    let pipeline = Arc::new(Pipeline::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Duration::from_secs(30),
        Duration::from_secs(30),
        pipeline.clone(),
    ));
    (
        ApiState::new(pipeline.clone(), dispatcher.clone(), None),
        pipeline,
        dispatcher,
    )
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_version() {
    let (s, _, _) = state();
    let app = create_app(s);
    let resp = app
        .oneshot(Request::get("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, env!("CARGO_PKG_VERSION").as_bytes());
}

#[tokio::test]
async fn test_post_alert_accept_and_sanitize() {
    let (s, _, dispatcher) = state();
    let app = create_app(s);

    let resp = app
        .oneshot(json_request(
            "POST",
            "/alerts",
            json!({
                "From": "mon",
                "Title": "t",
                "Routes": ["smuggled"],
                "Sub": [{"From": "x", "Title": "y"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let pooled = dispatcher.peek();
    assert_eq!(pooled.len(), 1);
    assert_eq!(pooled[0].from, "mon");
    // Ingress sanitization: no routes, no sub, date filled.
    assert!(pooled[0].routes.is_empty());
    assert!(pooled[0].sub.is_empty());
    assert!(!pooled[0].has_default_date());
}

#[tokio::test]
async fn test_post_alert_validation() {
    let (s, _, _) = state();
    let app = create_app(s);

    let bad = [
        json!({"From": "", "Title": "t"}),
        json!({"From": "m", "Title": ""}),
        json!({"From": "x".repeat(101), "Title": "t"}),
        json!({"From": "m", "Title": "y".repeat(251)}),
        json!({"From": "a\nb", "Title": "t"}),
        json!({"From": "m", "Title": "a\nb"}),
    ];
    for body in bad {
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/alerts", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_get_alerts_never_contains_stats() {
    let (s, _, dispatcher) = state();
    let app = create_app(s);

    let mut a = klaxon::Alert::new("mon", "t");
    a.set_stat("freq", 1.0);
    dispatcher.post(a);

    let resp = app
        .oneshot(Request::get("/alerts").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let v = body_json(resp).await;
    let arr = v.as_array().unwrap();
    assert_eq!(arr.len(), 1);
    assert!(arr[0].get("Stats").is_none());
    assert_eq!(arr[0]["From"], "mon");
}

#[tokio::test]
async fn test_filter_lifecycle() {
    let (s, pipeline, _) = state();
    let app = create_app(s);

    // PUT a dynamic filter.
    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/filters/f1",
            json!({"type": "discard", "if": "alert.From == \"noisy\""}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // It shows up in the list and its params round-trip with the type.
    let resp = app
        .clone()
        .oneshot(Request::get("/filters").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!(["f1"]));

    let resp = app
        .clone()
        .oneshot(Request::get("/filters/f1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let v = body_json(resp).await;
    assert_eq!(v["type"], "discard");
    assert_eq!(v["if"], "alert.From == \"noisy\"");

    assert!(pipeline.get_filter("f1").unwrap().dynamic());

    // DELETE removes the dynamic filter.
    let resp = app
        .clone()
        .oneshot(Request::delete("/filters/f1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(Request::get("/filters/f1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_static_filter_is_refused() {
    let (s, pipeline, _) = state();
    let f = new_filter("discard", "keeper", &serde_json::Map::new()).unwrap();
    pipeline.add_static_filter(f).unwrap();

    let app = create_app(s);
    let resp = app
        .clone()
        .oneshot(Request::delete("/filters/keeper").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Still there.
    let resp = app
        .oneshot(Request::get("/filters/keeper").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_enable_disable_inactivate() {
    let (s, pipeline, _) = state();
    let f = new_filter("discard", "gate", &serde_json::Map::new()).unwrap();
    pipeline.add_static_filter(f).unwrap();
    let app = create_app(s);

    let resp = app
        .clone()
        .oneshot(Request::put("/filters/gate/disable").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(pipeline.get_filter("gate").unwrap().disabled());

    let resp = app
        .clone()
        .oneshot(Request::put("/filters/gate/enable").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!pipeline.get_filter("gate").unwrap().disabled());

    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/filters/gate/inactivate",
            json!({"until": "2099-01-01T00:00:00Z"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(pipeline.get_filter("gate").unwrap().disabled());

    // enable clears the inactivation window.
    app.clone()
        .oneshot(Request::put("/filters/gate/enable").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(!pipeline.get_filter("gate").unwrap().disabled());

    // Unknown filter id is a 404.
    let resp = app
        .oneshot(Request::put("/filters/ghost/enable").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_filter_type_is_internal_error() {
    let (s, _, _) = state();
    let app = create_app(s);
    let resp = app
        .oneshot(json_request("PUT", "/filters/f1", json!({"type": "bogus"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_route_lifecycle() {
    let (s, _, _) = state();
    let app = create_app(s);

    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/routes/notify",
            json!([{"type": "exec", "command": ["cat"]}]),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(Request::get("/routes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!(["notify"]));

    let resp = app
        .clone()
        .oneshot(Request::get("/routes/notify").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let v = body_json(resp).await;
    assert_eq!(v[0]["type"], "exec");
    assert_eq!(v[0]["command"], json!(["cat"]));

    let resp = app
        .clone()
        .oneshot(Request::get("/routes/ghost").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // A broken transport table leaves the route untouched.
    let resp = app
        .oneshot(json_request("PUT", "/routes/notify", json!([{"type": "bogus"}])))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_invalid_ids_are_rejected() {
    let (s, _, _) = state();
    let app = create_app(s);

    let resp = app
        .clone()
        .oneshot(Request::get("/filters/bad%20id").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(json_request("PUT", "/routes/bad%2Fid", json!([])))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
