use super::*;
use axum::{http::StatusCode, routing::post, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_remote() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route(
            "/api/query/get_server",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "server_id": body["server_id"],
                    "name": "devs",
                    "owner_id": "alice"
                }))
            }),
        )
        .route(
            "/api/query/get_server_members",
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"code": "not_found", "message": "no such server"})),
                )
            }),
        )
        .route(
            "/api/update/send_message",
            post(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/api"))
}

#[test]
fn classify_maps_statuses_onto_taxonomy() {
    assert_eq!(
        classify("x", RemoteResponse::ok(json!({"a": 1}))),
        Ok(json!({"a": 1}))
    );
    assert!(matches!(
        classify("x", RemoteResponse::error(410, ErrorCode::Internal, "gone")),
        Err(FetchError::InvalidResource { .. })
    ));
    assert!(matches!(
        classify("x", RemoteResponse::error(429, ErrorCode::Unknown, "slow down")),
        Err(FetchError::RateLimited { .. })
    ));
    assert!(matches!(
        classify("x", RemoteResponse::error(422, ErrorCode::Validation, "bad id")),
        Err(FetchError::Validation(ValidationError::MalformedPayload { .. }))
    ));
    assert_eq!(
        classify("x", RemoteResponse::error(503, ErrorCode::Internal, "down")),
        Err(FetchError::Remote {
            status: 503,
            message: "down".to_string()
        })
    );
}

#[test]
fn classify_honours_error_codes_on_generic_statuses() {
    let response = RemoteResponse::error(403, ErrorCode::Unsupported, "not in this canister");
    match classify("member_list:S1", response) {
        Err(FetchError::InvalidResource { resource, reason }) => {
            assert_eq!(resource, "member_list:S1");
            assert_eq!(reason, "not in this canister");
        }
        other => panic!("unexpected {other:?}"),
    }

    let bare = RemoteResponse {
        status: 500,
        body: Value::Null,
    };
    assert_eq!(
        classify("x", bare),
        Err(FetchError::Remote {
            status: 500,
            message: "status 500".to_string()
        })
    );
}

#[test]
fn http_remote_rejects_non_http_schemes() {
    assert!(HttpRemoteSource::new("ftp://example.com").is_err());
    assert!(HttpRemoteSource::new("not a url").is_err());
    let remote = HttpRemoteSource::new("https://example.com/api").expect("valid");
    assert_eq!(remote.base_url().as_str(), "https://example.com/api/");
}

#[tokio::test]
async fn http_remote_posts_json_to_method_scoped_paths() -> anyhow::Result<()> {
    let base = spawn_remote().await?;
    let remote = HttpRemoteSource::new(&base)?;

    let value = invoke(
        &remote,
        Endpoint::GetServer,
        "server_snapshot:S1",
        &json!({"server_id": "S1"}),
    )
    .await?;
    assert_eq!(value["server_id"], "S1");
    assert_eq!(value["name"], "devs");
    Ok(())
}

#[tokio::test]
async fn http_remote_surfaces_typed_errors() -> anyhow::Result<()> {
    let base = spawn_remote().await?;
    let remote = HttpRemoteSource::new(&base)?;

    let missing = invoke(&remote, Endpoint::GetServerMembers, "member_list:S1", &json!({})).await;
    assert!(matches!(missing, Err(FetchError::InvalidResource { .. })));

    let limited = invoke(&remote, Endpoint::SendMessage, "send_message:S1/C1#1", &json!({})).await;
    assert!(matches!(limited, Err(FetchError::RateLimited { .. })));
    Ok(())
}

#[tokio::test]
async fn http_remote_reports_transport_failures_as_network_errors() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let remote = HttpRemoteSource::new(&format!("http://{addr}"))?;
    let result = invoke(&remote, Endpoint::GetServer, "server_snapshot:S1", &json!({})).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
    Ok(())
}
