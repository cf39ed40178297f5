//! Pod lookup against a fake pods API

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use kube::config::Kubeconfig;
use podtunnel_client::{
    resolve_context, ApiWorkloadLocator, LocateError, TunnelError, WorkloadLocator,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;
use url::Url;

async fn list_pods(
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer test-token") {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "Unauthorized",
            "reason": "Unauthorized",
            "code": 401,
        });
        return Err((StatusCode::UNAUTHORIZED, Json(status)));
    }

    let items = match (namespace.as_str(), query.get("labelSelector").map(String::as_str)) {
        ("shop", Some("app=web")) => json!([
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web-pending"}, "status": {"phase": "Pending"}},
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web-running"}, "status": {"phase": "Running"}},
        ]),
        ("shop", Some("app=batch")) => json!([
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "batch-done"}, "status": {"phase": "Succeeded"}},
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "batch-failed"}, "status": {"phase": "Failed"}},
        ]),
        _ => json!([]),
    };

    Ok(Json(json!({
        "kind": "PodList",
        "apiVersion": "v1",
        "metadata": {"resourceVersion": "1"},
        "items": items,
    })))
}

async fn pods_api() -> Url {
    let app = Router::new().route("/api/v1/namespaces/{namespace}/pods", get(list_pods));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Url::parse(&format!("http://{}", addr)).unwrap()
}

async fn locator(url: Url, token: &str, selector: &str) -> ApiWorkloadLocator {
    let kubeconfig = Kubeconfig::from_yaml(&format!(
        r#"
current-context: fake
clusters:
- name: fake
  cluster:
    server: {}
contexts:
- name: fake
  context:
    cluster: fake
    user: tester
users:
- name: tester
  user:
    token: {}
"#,
        url.as_str().trim_end_matches('/'),
        token
    ))
    .unwrap();
    let context = resolve_context(kubeconfig, None).await.unwrap();

    ApiWorkloadLocator::new(context.config, Some(selector.to_string())).unwrap()
}

#[tokio::test]
async fn test_prefers_running_pod() {
    let url = pods_api().await;

    let target = locator(url, "test-token", "app=web")
        .await
        .locate("shop")
        .await
        .unwrap();

    assert_eq!(target.namespace, "shop");
    assert_eq!(target.pod, "web-running");
}

#[tokio::test]
async fn test_falls_back_to_first_pod() {
    let url = pods_api().await;

    let target = locator(url, "test-token", "app=batch")
        .await
        .locate("shop")
        .await
        .unwrap();

    assert_eq!(target.pod, "batch-done");
}

#[tokio::test]
async fn test_empty_list_is_precondition() {
    let url = pods_api().await;

    let err = locator(url, "test-token", "app=missing")
        .await
        .locate("shop")
        .await
        .unwrap_err();

    match &err {
        LocateError::NoPods {
            namespace,
            selector,
        } => {
            assert_eq!(namespace, "shop");
            assert_eq!(selector.as_deref(), Some("app=missing"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let err: TunnelError = err.into();
    assert_eq!(err.component(), "precondition");
}

#[tokio::test]
async fn test_api_error_keeps_status() {
    let url = pods_api().await;

    let err = locator(url, "wrong-token", "app=web")
        .await
        .locate("shop")
        .await
        .unwrap_err();

    match err {
        LocateError::Api { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Unauthorized");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
