use std::sync::Arc;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use parking_lot::Mutex;
use serde_json::{Value, json};
use swgate::api::{HttpRemoteApi, RemoteApi, SwitchEvent, UserLocation};
use swgate::config::ApiConfig;
use swgate::error::AppError;

#[derive(Default)]
struct Seen {
    requests: Mutex<Vec<(String, Option<String>, Option<String>, Value)>>,
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn record(seen: &Seen, req: &HttpRequest, body: &Value) {
    seen.requests.lock().push((
        req.path().to_string(),
        header(req, "user-agent"),
        header(req, "authorization"),
        body.clone(),
    ));
}

async fn users_created(
    req: HttpRequest,
    body: web::Json<Value>,
    seen: web::Data<Seen>,
) -> HttpResponse {
    record(&seen, &req, &body);
    HttpResponse::Created().json(json!({
        "users": [{
            "id": "u1",
            "accessToken": "tok-1",
            "location": { "id": "l1", "name": "Desk 1", "number": 1 }
        }]
    }))
}

async fn users_ok(req: HttpRequest, body: web::Json<Value>, seen: web::Data<Seen>) -> HttpResponse {
    record(&seen, &req, &body);
    HttpResponse::Ok().json(json!({ "users": [] }))
}

async fn users_garbled(
    req: HttpRequest,
    body: web::Json<Value>,
    seen: web::Data<Seen>,
) -> HttpResponse {
    record(&seen, &req, &body);
    HttpResponse::Created().body("not json")
}

async fn call_external(
    req: HttpRequest,
    body: web::Json<Value>,
    seen: web::Data<Seen>,
) -> HttpResponse {
    record(&seen, &req, &body);
    match header(&req, "authorization").as_deref() {
        Some("Bearer good") => HttpResponse::Ok().json(json!({ "data": { "ticket": 12 } })),
        Some("Bearer plain") => HttpResponse::Ok().json(json!({ "queued": true })),
        Some("Bearer expired") => HttpResponse::Unauthorized().finish(),
        _ => HttpResponse::InternalServerError().body("boom"),
    }
}

async fn upstream() -> (String, Arc<Seen>) {
    let seen = web::Data::new(Seen::default());
    let data = seen.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/users", web::post().to(users_created))
            .route("/users-ok", web::post().to(users_ok))
            .route("/users-garbled", web::post().to(users_garbled))
            .route(
                "/api/v1/companies/{company}/queues/call-external",
                web::post().to(call_external),
            )
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    (format!("http://{addr}"), seen.into_inner())
}

fn client(url: &str, endpoint: &str) -> HttpRemoteApi {
    HttpRemoteApi::new(ApiConfig {
        url: url.to_string(),
        endpoint: endpoint.to_string(),
        device_id: "pi-7".to_string(),
        company_id: "acme".to_string(),
    })
}

fn event() -> SwitchEvent {
    SwitchEvent::calling(
        "pi-7",
        UserLocation {
            id: "l1".into(),
            name: "Desk 1".into(),
            number: 1,
        },
    )
}

#[actix_rt::test]
async fn fetch_users_accepts_201() {
    let (url, seen) = upstream().await;

    let response = client(&url, "/users").fetch_users().await.unwrap();

    assert_eq!(response.users.len(), 1);
    assert_eq!(response.users[0].access_token, "tok-1");
    let requests = seen.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    let (path, agent, auth, body) = &requests[0];
    assert_eq!(path, "/users");
    assert_eq!(agent.as_deref(), Some("RaspberryPi-GPIO-Controller/1.0/pi-7"));
    assert_eq!(auth, &None);
    assert_eq!(body, &json!({ "branchId": "pi-7" }));
}

#[actix_rt::test]
async fn fetch_users_rejects_other_success_codes() {
    let (url, _) = upstream().await;

    let err = client(&url, "users-ok").fetch_users().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::ApiRequestFailed {
            status: Some(200),
            ..
        }
    ));
}

#[actix_rt::test]
async fn fetch_users_rejects_malformed_payload() {
    let (url, _) = upstream().await;

    let err = client(&url, "users-garbled").fetch_users().await.unwrap_err();
    assert!(err.to_string().contains("malformed users payload"));
}

#[actix_rt::test]
async fn switch_event_returns_data_member() {
    let (url, seen) = upstream().await;

    let data = client(&url, "users")
        .send_switch_event(&event(), "good")
        .await
        .unwrap();

    assert_eq!(data, json!({ "ticket": 12 }));
    let requests = seen.requests.lock().clone();
    let (path, _, auth, body) = &requests[0];
    assert_eq!(path, "/api/v1/companies/acme/queues/call-external");
    assert_eq!(auth.as_deref(), Some("Bearer good"));
    assert_eq!(body["status"], "calling");
    assert_eq!(body["branchId"], "pi-7");
    assert_eq!(body["isMultiService"], false);
}

#[actix_rt::test]
async fn switch_event_without_data_returns_body() {
    let (url, _) = upstream().await;

    let value = client(&url, "users")
        .send_switch_event(&event(), "plain")
        .await
        .unwrap();
    assert_eq!(value, json!({ "queued": true }));
}

#[actix_rt::test]
async fn switch_event_401_is_unauthorized() {
    let (url, _) = upstream().await;

    let err = client(&url, "users")
        .send_switch_event(&event(), "expired")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));
}

#[actix_rt::test]
async fn switch_event_server_error_keeps_status() {
    let (url, _) = upstream().await;

    let err = client(&url, "users")
        .send_switch_event(&event(), "other")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::ApiRequestFailed {
            status: Some(500),
            ..
        }
    ));
}

#[actix_rt::test]
async fn unreachable_upstream_is_transport_failure() {
    let err = client("http://127.0.0.1:1", "users")
        .fetch_users()
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ApiRequestFailed { status: None, .. }));
}
