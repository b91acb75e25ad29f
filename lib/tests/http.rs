//! Tracking endpoints and mail api driven through the router.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use futures::StreamExt;
use http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use http::{Request, Response, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use notificas::mail::{MailDocument, MailStatus, Tracking};
use notificas::tracking::{encode_url, PIXEL_PNG};
use notificas::{Config, Database};

const TOKEN: &str = "0123456789abcdef0123456789abcdef";
const WRONG: &str = "ffffffffffffffffffffffffffffffff";

fn config() -> Config {
    let mut config = Config::default();
    config.tracking.base_url = "https://track.example.com".to_string();
    config
}

fn app(db: &Database, config: Config) -> axum::Router {
    notificas::axum::app(db.clone(), Arc::new(config), None)
}

/// Stores a document that went through a successful dispatch.
fn sent_doc(db: &Database) -> Uuid {
    let doc = MailDocument {
        id: Uuid::new_v4(),
        to: vec!["a@b.com".to_string()],
        tracking: Some(Tracking::new(TOKEN.to_string(), "<m@notificas.com>".to_string())),
        ..Default::default()
    };
    db.set(&doc).unwrap();
    doc.id
}

fn tracking(db: &Database, id: Uuid) -> Tracking {
    db.get::<MailDocument>(id).unwrap().tracking.unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn open_with_valid_token_serves_pixel_and_counts() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(&app, &format!("/trackOpen?msg={id}&k={TOKEN}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    assert!(response.headers()["cache-control"]
        .to_str()
        .unwrap()
        .contains("no-cache"));
    assert_eq!(body_bytes(response).await, PIXEL_PNG.to_vec());

    let tracking = tracking(&db, id);
    assert_eq!(tracking.open_count, 1);
    assert!(tracking.opened);
}

#[tokio::test]
async fn open_always_serves_the_pixel() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    for uri in [
        format!("/trackOpen?msg={id}&k={WRONG}"),
        format!("/trackOpen?msg={}&k={TOKEN}", Uuid::new_v4()),
        format!("/trackOpen?msg=garbage&k={TOKEN}"),
    ] {
        let response = get(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(body_bytes(response).await, PIXEL_PNG.to_vec());
    }
    assert_eq!(tracking(&db, id).open_count, 0);
    assert!(!tracking(&db, id).opened);
}

#[tokio::test]
async fn missing_params_are_bad_requests() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    for uri in [
        format!("/trackOpen?msg={id}"),
        "/trackOpen".to_string(),
        format!("/linkRedirect?msg={id}&k={TOKEN}"),
        format!("/confirmRead?k={TOKEN}"),
        format!("/confirmRead?msg={id}&k="),
    ] {
        assert_eq!(get(&app, &uri).await.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn concurrent_opens_are_both_counted() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);
    let uri = format!("/trackOpen?msg={id}&k={TOKEN}");

    let (a, b) = tokio::join!(get(&app, &uri), get(&app, &uri));
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(tracking(&db, id).open_count, 2);
}

#[tokio::test]
async fn redirect_goes_to_the_encoded_target() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);
    let target = "https://example.com/path?a=1&b=2+3";

    let response = get(
        &app,
        &format!("/linkRedirect?msg={id}&u={}&k={TOKEN}", encode_url(target)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], target);

    let tracking = tracking(&db, id);
    assert_eq!(tracking.click_count, 1);
    assert_eq!(tracking.clicks[0].url, target);
    assert!(tracking.last_click_at.is_some());
}

#[tokio::test]
async fn redirect_ignores_the_token_but_only_records_valid_ones() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(
        &app,
        &format!("/linkRedirect?msg={id}&u={}&k={WRONG}", encode_url("http://x.com")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], "http://x.com");
    assert_eq!(tracking(&db, id).click_count, 0);
    assert!(tracking(&db, id).clicks.is_empty());
}

#[tokio::test]
async fn redirect_for_unknown_mail_still_goes_to_the_target() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let target = "https://example.com/landing";

    for msg in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
        let response = get(
            &app,
            &format!("/linkRedirect?msg={msg}&u={}&k={TOKEN}", encode_url(target)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], target);
    }
    assert_eq!(db.len::<MailDocument>().unwrap(), 0);
}

#[tokio::test]
async fn undecodable_links_go_to_the_fallback() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(&app, &format!("/linkRedirect?msg={id}&u=%2A%2A%2A&k={TOKEN}")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], "https://notificas.com");
    assert_eq!(tracking(&db, id).click_count, 0);
}

#[tokio::test]
async fn confirm_read_outcomes() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(&app, &format!("/confirmRead?msg={id}&k={WRONG}")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!tracking(&db, id).read_confirmed);

    let response = get(&app, &format!("/confirmRead?msg={}&k={TOKEN}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app, &format!("/confirmRead?msg={id}&k={TOKEN}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(page.contains("Lectura confirmada"));

    let tracking = tracking(&db, id);
    assert!(tracking.read_confirmed);
    assert!(tracking.read_confirmed_at.is_some());
}

fn post_json(uri: &str, body: &str, key: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        request = request.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    request.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn mail_api_requires_the_configured_key() {
    let db = Database::temporary().unwrap();
    let mut config = config();
    config.api.key = "secret".to_string();
    let app = app(&db, config);
    let body = r#"{"to":"a@b.com","subject":"S","html":"<p>hola</p>"}"#;

    let response = app
        .clone()
        .oneshot(post_json("/api/mail", body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(post_json("/api/mail", body, Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(db.len::<MailDocument>().unwrap(), 0);

    let response = app
        .clone()
        .oneshot(post_json("/api/mail", body, Some("secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

    let doc: MailDocument = db.get(id).unwrap();
    assert_eq!(doc.to, vec!["a@b.com".to_string()]);
    assert_eq!(doc.message.text, "hola");
    assert!(doc.delivery.is_none());
}

#[tokio::test]
async fn invalid_recipients_are_rejected() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());

    let response = app
        .clone()
        .oneshot(post_json("/api/mail", r#"{"to":[],"html":"x"}"#, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_hides_the_token() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(&app, &format!("/api/mail/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body_bytes(response).await;
    let status: MailStatus = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status.id, id);
    assert_eq!(status.tracking.unwrap().token, "");
    assert!(!String::from_utf8(bytes).unwrap().contains(TOKEN));

    let response = get(&app, &format!("/api/mail/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_start_with_the_current_status() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let id = sent_doc(&db);

    let response = get(&app, &format!("/api/mail/{id}/events")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.contains("event: status"));
    assert!(first.contains(&id.to_string()));
}

#[tokio::test]
async fn certify_without_chain_is_unavailable() {
    let db = Database::temporary().unwrap();
    let app = app(&db, config());
    let body = r#"{"type":"read","messageId":"m","userId":"u"}"#;

    let response = app
        .clone()
        .oneshot(post_json("/api/certify", body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
