//! External scheduling service client.
//!
//! The HTTP adapter speaks a small JSON contract rooted at the configured base
//! URL:
//!
//! - `POST {base}/{country}/sessions` with `{email, password}` returns `{token}`
//! - `GET {base}/{country}/schedules/{schedule}/facilities/{facility}/dates`
//!   returns `[{"date": "YYYY-MM-DD"}, ...]`
//! - `POST {base}/{country}/schedules/{schedule}/appointments` with
//!   `{facility_id, date}` books a slot; 2xx means accepted, 409/422 means the
//!   slot was taken.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::WorkerEnv;
use crate::error::WatchError;

/// Operations the watch loop needs from the scheduling service.
#[async_trait]
pub trait SchedulingApi: Send + Sync {
    /// Authenticated session state carried between calls.
    type Session: Send + Sync;

    /// Establish a session.
    async fn initialize(&self) -> Result<Self::Session, WatchError>;

    /// Dates currently offered for booking.
    async fn available_dates(&self, session: &Self::Session)
    -> Result<Vec<NaiveDate>, WatchError>;

    /// Try to claim `date`. `Ok(false)` means the service declined.
    async fn book(&self, session: &Self::Session, date: NaiveDate) -> Result<bool, WatchError>;
}

/// Bearer token returned by the session endpoint.
pub struct HttpSession {
    token: SecretString,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Deserialize)]
struct DateSlot {
    date: NaiveDate,
}

/// JSON-over-HTTP scheduling client.
pub struct HttpSchedulingApi {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: SecretString,
    country_code: String,
    schedule_id: String,
    facility_id: String,
}

impl HttpSchedulingApi {
    pub fn new(env: &WorkerEnv) -> Result<Self, WatchError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: env.api_url.trim_end_matches('/').to_string(),
            email: env.email.clone(),
            password: env.password.clone(),
            country_code: env.country_code.clone(),
            schedule_id: env.schedule_id.clone(),
            facility_id: env.facility_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.country_code)
    }
}

/// Map auth failures to session errors and other non-2xx codes to
/// invalid-response errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, WatchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(WatchError::Session(format!("{status}: {body}")))
    } else {
        Err(WatchError::InvalidResponse(format!("{status}: {body}")))
    }
}

#[async_trait]
impl SchedulingApi for HttpSchedulingApi {
    type Session = HttpSession;

    async fn initialize(&self) -> Result<HttpSession, WatchError> {
        let body = serde_json::json!({
            "email": self.email,
            "password": self.password.expose_secret(),
        });
        let resp = self
            .client
            .post(self.url("sessions"))
            .json(&body)
            .send()
            .await?;
        let session: SessionResponse = check_status(resp).await?.json().await?;
        if session.token.is_empty() {
            return Err(WatchError::Session("empty session token".into()));
        }
        Ok(HttpSession {
            token: SecretString::from(session.token),
        })
    }

    async fn available_dates(&self, session: &HttpSession) -> Result<Vec<NaiveDate>, WatchError> {
        let path = format!(
            "schedules/{}/facilities/{}/dates",
            self.schedule_id, self.facility_id
        );
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(session.token.expose_secret())
            .send()
            .await?;
        let slots: Vec<DateSlot> = check_status(resp).await?.json().await?;
        Ok(slots.into_iter().map(|s| s.date).collect())
    }

    async fn book(&self, session: &HttpSession, date: NaiveDate) -> Result<bool, WatchError> {
        let path = format!("schedules/{}/appointments", self.schedule_id);
        let body = serde_json::json!({
            "facility_id": self.facility_id,
            "date": date,
        });
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(session.token.expose_secret())
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
            _ => check_status(resp).await.map(|_| true),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::{Value, json};

    use super::*;

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer tok-1")
    }

    async fn start_service() -> String {
        let app = Router::new()
            .route(
                "/en-ca/sessions",
                post(|Json(body): Json<Value>| async move {
                    if body["password"] == "hunter2" {
                        (StatusCode::OK, Json(json!({"token": "tok-1"})))
                    } else {
                        (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad login"})))
                    }
                }),
            )
            .route(
                "/en-ca/schedules/123/facilities/94/dates",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return (StatusCode::UNAUTHORIZED, Json(json!([])));
                    }
                    (
                        StatusCode::OK,
                        Json(json!([{"date": "2024-01-08"}, {"date": "2024-01-03"}])),
                    )
                }),
            )
            .route(
                "/en-ca/schedules/123/appointments",
                post(|Json(body): Json<Value>| async move {
                    if body["date"] == "2024-01-03" {
                        StatusCode::CREATED
                    } else {
                        StatusCode::CONFLICT
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn env(api_url: String, password: &str) -> WorkerEnv {
        WorkerEnv {
            email: "alice@example.com".into(),
            password: SecretString::from(password.to_string()),
            country_code: "en-ca".into(),
            schedule_id: "123".into(),
            facility_id: "94".into(),
            refresh_delay: Duration::from_secs(3),
            api_url,
            cooldown: Duration::from_secs(3600),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn session_dates_and_booking() {
        let api = HttpSchedulingApi::new(&env(start_service().await, "hunter2")).unwrap();

        let session = api.initialize().await.unwrap();
        let dates = api.available_dates(&session).await.unwrap();
        assert_eq!(dates, vec![date("2024-01-08"), date("2024-01-03")]);

        assert!(api.book(&session, date("2024-01-03")).await.unwrap());
        assert!(!api.book(&session, date("2024-01-08")).await.unwrap());
    }

    #[tokio::test]
    async fn rejected_login_is_a_session_error() {
        let api = HttpSchedulingApi::new(&env(start_service().await, "wrong")).unwrap();
        let err = api.initialize().await.err().unwrap();
        assert!(matches!(err, WatchError::Session(_)));
    }
}
