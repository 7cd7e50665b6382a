mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::file_engine;
use dynamic_entities::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn define_materialize_and_use_an_entity_over_http() {
    let t = file_engine().await;
    let router = app(AppState::new(t.engine.clone()));

    let (status, _) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, ready) = call(&router, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["entities"], 0);

    let (status, created) = call(
        &router,
        "POST",
        "/admin/definitions",
        Some(json!({
            "name": "Book",
            "fields": [
                { "name": "title", "type": "short-text", "required": true },
                { "name": "pages", "type": "integer" }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", created);
    let id = created["data"]["id"].as_i64().unwrap();
    assert_eq!(created["data"]["storage_name"], "book");

    let (status, _) = call(&router, "GET", "/data/Book", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, outcome) = call(&router, "POST", &format!("/admin/entities/{}/create_table", id), None).await;
    assert_eq!(status, StatusCode::OK, "{}", outcome);
    assert_eq!(outcome["data"]["success"], true);
    assert!(outcome["data"]["backup"].is_string());

    let (status, row) = call(&router, "POST", "/data/book", Some(json!({"title": "Dune", "pages": "412"}))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", row);
    assert_eq!(row["data"]["pages"], 412);
    let book = row["data"]["id"].as_i64().unwrap();

    let (status, list) = call(&router, "GET", "/data/Book?title=Dune&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["meta"]["count"], 1);

    let (status, err) = call(&router, "POST", "/data/Book", Some(json!({"pages": 3}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["error"]["code"], "validation_error");

    let (status, _) = call(&router, "DELETE", &format!("/data/Book/{}", book), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, "GET", &format!("/data/Book/{}", book), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, schema) = call(&router, "GET", "/admin/schema", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schema["data"]["details"]["entities"][0]["name"], "Book");

    let (status, again) = call(&router, "POST", &format!("/admin/entities/{}/create_table", id), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(again["data"]["success"], false);
}

#[tokio::test]
async fn restore_outside_backup_directory_is_refused() {
    let t = file_engine().await;
    let router = app(AppState::new(t.engine.clone()));
    let outside = t.database_path();

    let (status, err) = call(
        &router,
        "POST",
        "/admin/backups/restore",
        Some(json!({ "path": outside })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["code"], "restore_error");

    let (status, status_body) = call(&router, "GET", "/admin/backups/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(status_body["data"]["details"]["count"], 0);
}
