//! Gmail REST provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    decode_base64url, encode_base64url, HistoryPage, HistoryRecord, MailProvider, RawThread,
    ThreadPage, ThreadQuery,
};
use crate::error::ProviderError;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TOKEN_SKEW_SECONDS: i64 = 60;
const MAX_PAGE_SIZE: usize = 500;
const BODY_EXCERPT_LEN: usize = 200;

/// OAuth client and refresh token for one mailbox.
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Gmail API client authenticated with a refresh token.
pub struct GmailProvider {
    client: Client,
    api_base: String,
    token_url: String,
    /// Path segment for `users/{id}`: `me` or a delegated mailbox address.
    user_id: String,
    mailbox: String,
    credentials: GmailCredentials,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

const fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadStub>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryList {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    next_page_token: Option<String>,
    history_id: String,
}

#[derive(Deserialize)]
struct HistoryEntry {
    id: String,
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    thread_id: String,
}

#[derive(Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

impl GmailProvider {
    /// Create a provider for `mailbox`.
    ///
    /// When `delegated` is set, API calls address the mailbox explicitly instead of
    /// the authenticated user (`me`).
    #[must_use]
    pub fn new(mailbox: impl Into<String>, credentials: GmailCredentials, delegated: bool) -> Self {
        let mailbox = mailbox.into();
        let user_id = if delegated {
            mailbox.clone()
        } else {
            "me".to_string()
        };
        Self {
            client: Client::new(),
            api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            user_id,
            mailbox,
            credentials,
            token: Mutex::new(None),
        }
    }

    /// Point the client at a different API root (used against local stubs).
    #[must_use]
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    fn user_url(&self, path: &str) -> String {
        format!("{}/users/{}/{path}", self.api_base, self.user_id)
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(ProviderError::Auth(format!(
                "token refresh returned {status}: {}",
                excerpt(&body)
            )));
        }

        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("token response: {e}")))?;
        let expires_at =
            Utc::now() + Duration::seconds(payload.expires_in.saturating_sub(TOKEN_SKEW_SECONDS));
        debug!("refreshed gmail access token, valid until {expires_at}");

        let value = payload.access_token.clone();
        *cached = Some(AccessToken {
            value: payload.access_token,
            expires_at,
        });
        Ok(value)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body, what));
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Decode(format!("{what}: {e}")))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn mailbox(&self) -> &str {
        &self.mailbox
    }

    async fn current_history_id(&self) -> Result<String, ProviderError> {
        let request = self.client.get(self.user_url("profile"));
        let profile: Profile = self.execute(request, "profile").await?;
        Ok(profile.history_id)
    }

    async fn list_threads(
        &self,
        query: &ThreadQuery,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, ProviderError> {
        let mut params: Vec<(&str, String)> = vec![(
            "maxResults",
            query.page_size.clamp(1, MAX_PAGE_SIZE).to_string(),
        )];
        if let Some(q) = &query.q {
            params.push(("q", q.clone()));
        }
        if let Some(label) = &query.label {
            params.push(("labelIds", label.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let request = self.client.get(self.user_url("threads")).query(&params);
        let list: ThreadList = self.execute(request, "thread list").await?;
        Ok(ThreadPage {
            thread_ids: list.threads.into_iter().map(|t| t.id).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn list_history(
        &self,
        start_history_id: &str,
        label: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let mut params: Vec<(&str, String)> = vec![
            ("startHistoryId", start_history_id.to_string()),
            ("maxResults", MAX_PAGE_SIZE.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("historyTypes", "labelAdded".to_string()),
        ];
        if let Some(label) = label {
            params.push(("labelId", label.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let request = self.client.get(self.user_url("history")).query(&params);
        let list: HistoryList = match self.execute(request, "history").await {
            Ok(list) => list,
            // Gmail answers 404 once the start id has aged out of its history window.
            Err(ProviderError::NotFound(_)) => return Err(ProviderError::HistoryExpired),
            Err(e) => return Err(e),
        };

        Ok(HistoryPage {
            records: list
                .history
                .into_iter()
                .map(|entry| HistoryRecord {
                    id: entry.id,
                    thread_ids: entry.messages.into_iter().map(|m| m.thread_id).collect(),
                })
                .collect(),
            next_page_token: list.next_page_token,
            history_id: list.history_id,
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<RawThread, ProviderError> {
        let request = self
            .client
            .get(self.user_url(&format!("threads/{thread_id}")))
            .query(&[("format", "full")]);
        self.execute(request, &format!("thread {thread_id}")).await
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let request = self.client.get(self.user_url(&format!(
            "messages/{message_id}/attachments/{attachment_id}"
        )));
        let body: AttachmentBody = self
            .execute(request, &format!("attachment {attachment_id}"))
            .await?;
        decode_base64url(&body.data)
    }

    async fn send_raw(
        &self,
        thread_id: Option<&str>,
        raw: &[u8],
    ) -> Result<String, ProviderError> {
        let mut body = json!({ "raw": encode_base64url(raw) });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }
        let request = self.client.post(self.user_url("messages/send")).json(&body);
        let sent: SentMessage = self.execute(request, "send").await?;
        Ok(sent.id)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::Decode(e.to_string())
    } else {
        ProviderError::Transient(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str, what: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::NOT_FOUND => ProviderError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("{what}: {}", excerpt(body)))
        }
        s if s.is_server_error() => ProviderError::Transient(format!("{what}: status {s}")),
        s => ProviderError::Api {
            status: s.as_u16(),
            body: excerpt(body),
        },
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses_for_retry() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "", "thread list"),
            ProviderError::RateLimited
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, "", "x").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "", "thread t1"),
            ProviderError::NotFound(w) if w == "thread t1"
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "denied", "x"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "nope", "x"),
            ProviderError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let body = "x".repeat(1000);
        assert_eq!(excerpt(&body).len(), BODY_EXCERPT_LEN);
    }

    #[test]
    fn delegated_mailbox_is_addressed_explicitly() {
        let creds = GmailCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
        };
        let me = GmailProvider::new("support@example.com", creds.clone(), false);
        assert!(me.user_url("profile").ends_with("/users/me/profile"));
        let delegated = GmailProvider::new("support@example.com", creds, true)
            .with_endpoints("http://127.0.0.1:9/gmail/v1", "http://127.0.0.1:9/token");
        assert_eq!(
            delegated.user_url("threads"),
            "http://127.0.0.1:9/gmail/v1/users/support@example.com/threads"
        );
    }

    #[tokio::test]
    async fn refreshes_token_and_maps_responses() {
        use axum::http::{HeaderMap, StatusCode as Http};
        use axum::extract::Query;
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use serde_json::Value;

        let app = Router::new()
            .route(
                "/token",
                post(|| async { Json(json!({ "access_token": "tok", "expires_in": 3600 })) }),
            )
            .route(
                "/gmail/v1/users/me/profile",
                get(|headers: HeaderMap| async move {
                    if headers.get("authorization").is_some_and(|v| v == "Bearer tok") {
                        Ok(Json(json!({ "historyId": "42" })))
                    } else {
                        Err(Http::UNAUTHORIZED)
                    }
                }),
            )
            .route(
                "/gmail/v1/users/me/history",
                get(|Query(params): Query<Vec<(String, String)>>| async move {
                    let has = |k: &str, v: &str| params.iter().any(|(pk, pv)| pk == k && pv == v);
                    if has("startHistoryId", "1") {
                        return Err((Http::NOT_FOUND, "history gone"));
                    }
                    if !(has("labelId", "INBOX")
                        && has("historyTypes", "messageAdded")
                        && has("historyTypes", "labelAdded"))
                    {
                        return Err((Http::BAD_REQUEST, "unfiltered history"));
                    }
                    Ok(Json(json!({
                        "history": [{ "id": "50", "messages": [{ "id": "m9", "threadId": "t9" }] }],
                        "historyId": "51"
                    })))
                }),
            )
            .route(
                "/gmail/v1/users/me/threads",
                get(|| async { Http::TOO_MANY_REQUESTS }),
            )
            .route(
                "/gmail/v1/users/me/messages/send",
                post(|Json(body): Json<Value>| async move {
                    let thread = body["threadId"].as_str().unwrap_or("new");
                    Json(json!({ "id": format!("sent-in-{thread}") }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let creds = GmailCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
        };
        let provider = GmailProvider::new("support@example.com", creds, false)
            .with_endpoints(format!("http://{addr}/gmail/v1"), format!("http://{addr}/token"));

        assert_eq!(provider.current_history_id().await.unwrap(), "42");
        assert_eq!(
            provider.list_history("1", Some("INBOX"), None).await.unwrap_err(),
            ProviderError::HistoryExpired
        );
        let delta = provider
            .list_history("40", Some("INBOX"), None)
            .await
            .unwrap();
        assert_eq!(delta.records[0].thread_ids, vec!["t9"]);
        assert_eq!(delta.history_id, "51");
        assert_eq!(
            provider
                .list_threads(&ThreadQuery::default(), None)
                .await
                .unwrap_err(),
            ProviderError::RateLimited
        );
        assert_eq!(provider.send_raw(Some("t1"), b"raw").await.unwrap(), "sent-in-t1");
        assert_eq!(provider.send_raw(None, b"raw").await.unwrap(), "sent-in-new");
    }

    #[test]
    fn history_json_collects_thread_ids() {
        let list: HistoryList = serde_json::from_str(
            r#"{"history":[{"id":"11","messages":[{"id":"m1","threadId":"t1"},{"id":"m2","threadId":"t2"}]}],"historyId":"12"}"#,
        )
        .unwrap();
        assert_eq!(list.history_id, "12");
        assert_eq!(list.history[0].messages[1].thread_id, "t2");
        assert!(list.next_page_token.is_none());
    }
}
