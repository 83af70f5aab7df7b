/// Request/response path to the CRM chat and notification API
///
/// Endpoints:
///   GET  /api/auth/me/
///   GET  /api/chat/conversations/
///   GET  /api/chat/conversations/:id/messages/
///   POST /api/chat/conversations/:id/messages/   body: {"content":"..."}
///   POST /api/chat/conversations/:id/read/
///   GET  /api/notifications/                     ?limit=N
///   POST /api/notifications/:id/read/
///   POST /api/notifications/read-all/
use crate::credentials::CredentialSource;
use crate::error::{Result, SyncError};
use crate::types::{Conversation, CurrentUser, Message, NotificationFeed};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn current_user(&self) -> Result<CurrentUser>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
    /// Direct send. The returned server copy is the promotion event.
    async fn post_message(&self, conversation_id: &str, body: &str) -> Result<Message>;
    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()>;
    async fn list_notifications(&self, limit: usize) -> Result<NotificationFeed>;
    async fn mark_notification_read(&self, notification_id: &str) -> Result<()>;
    async fn mark_all_notifications_read(&self) -> Result<()>;
}

// ─── Response shapes ─────────────────────────────────────────────────────────

/// List endpoints answer either paginated or as a bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Page<T> {
    Paged { results: Vec<T> },
    Plain(Vec<T>),
}

impl<T> Page<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Page::Paged { results } => results,
            Page::Plain(items) => items,
        }
    }
}

/// Best human-readable message out of an error body
fn error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "request rejected".to_string()
    } else {
        text.chars().take(200).collect()
    }
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

pub struct HttpChatApi {
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpChatApi {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
            request_timeout,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<Bytes> {
        let token = self.credentials.bearer().ok_or(SyncError::MissingCredentials)?;
        let url = self.url(path);
        let payload = match &body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };

        let request = Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| SyncError::Transport(format!("bad request {}: {}", url, e)))?;

        debug!("{} {}", method, url);
        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| SyncError::Timeout(format!("{} {}", method, path)))?
            .map_err(|e| SyncError::Transport(format!("{} {} failed: {}", method, path, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Transport(format!("reading {} body: {}", path, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                message: error_message(&bytes),
            });
        }
        Ok(bytes)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.request(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let bytes = self.request(Method::POST, path, Some(body)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// POST whose response body is ignored
    async fn post_empty(&self, path: &str) -> Result<()> {
        self.request(Method::POST, path, None).await?;
        Ok(())
    }
}

fn conversation_path(conversation_id: &str, rest: &str) -> String {
    format!(
        "/api/chat/conversations/{}/{}",
        urlencoding::encode(conversation_id),
        rest
    )
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn current_user(&self) -> Result<CurrentUser> {
        self.get_json("/api/auth/me/").await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let page: Page<Conversation> = self.get_json("/api/chat/conversations/").await?;
        Ok(page.into_vec())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let page: Page<Message> = self
            .get_json(&conversation_path(conversation_id, "messages/"))
            .await?;
        Ok(page.into_vec())
    }

    async fn post_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        self.post_json(
            &conversation_path(conversation_id, "messages/"),
            serde_json::json!({ "content": body }),
        )
        .await
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        self.post_empty(&conversation_path(conversation_id, "read/")).await
    }

    async fn list_notifications(&self, limit: usize) -> Result<NotificationFeed> {
        self.get_json(&format!("/api/notifications/?limit={}", limit))
            .await
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.post_empty(&format!(
            "/api/notifications/{}/read/",
            urlencoding::encode(notification_id)
        ))
        .await
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.post_empty("/api/notifications/read-all/").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn test_page_accepts_both_shapes() {
        let paged: Page<u32> = serde_json::from_str(r#"{"count":2,"results":[1,2]}"#).unwrap();
        assert_eq!(paged.into_vec(), vec![1, 2]);
        let plain: Page<u32> = serde_json::from_str("[3]").unwrap();
        assert_eq!(plain.into_vec(), vec![3]);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(br#"{"detail":"Not allowed"}"#), "Not allowed");
        assert_eq!(error_message(b"Bad Gateway"), "Bad Gateway");
        assert_eq!(error_message(b""), "request rejected");
    }

    /// One-route server: answers every request with `status` and `body`,
    /// recording "METHOD path auth-header"
    async fn serve(status: StatusCode, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let log = log.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let log = log.clone();
                        async move {
                            let auth = req
                                .headers()
                                .get(AUTHORIZATION)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            let target = req
                                .uri()
                                .path_and_query()
                                .map(|p| p.as_str().to_string())
                                .unwrap_or_default();
                            log.lock().unwrap().push(format!("{} {} {}", req.method(), target, auth));
                            let resp = Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap();
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        (format!("http://{}", addr), seen)
    }

    #[tokio::test]
    async fn test_list_messages_sends_bearer() {
        let body = r#"{"results":[{"id":"m1","conversation_id":"c 1","sender_id":"u2","content":"hi","created_at":"2024-05-01T12:00:00Z"}]}"#;
        let (base, seen) = serve(StatusCode::OK, body).await;
        let api = HttpChatApi::new(base, Arc::new(StaticCredentials::new("tok")), Duration::from_secs(5));

        let messages = api.list_messages("c 1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hi");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["GET /api/chat/conversations/c%201/messages/ Bearer tok".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejected_request_maps_to_http_error() {
        let (base, _seen) = serve(StatusCode::FORBIDDEN, r#"{"detail":"Not a participant"}"#).await;
        let api = HttpChatApi::new(base, Arc::new(StaticCredentials::new("tok")), Duration::from_secs(5));

        let err = api.post_message("c1", "hello").await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("Not a participant"));
    }

    #[tokio::test]
    async fn test_missing_credentials_short_circuits() {
        let api = HttpChatApi::new(
            "http://127.0.0.1:9",
            Arc::new(StaticCredentials::empty()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            api.mark_all_notifications_read().await,
            Err(SyncError::MissingCredentials)
        ));
    }
}
