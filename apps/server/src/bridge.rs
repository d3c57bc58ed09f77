use std::time::Duration;

use axum::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared_proto::signaling::{MessageId, Payload};

use crate::error::BridgeError;
use crate::models::{BackendEnvelope, EndSessionRequest, SessionRef, SinceQuery};

/// Longest backend error body echoed into logs and error envelopes.
const MAX_ERROR_BODY: usize = 512;

/// The external system of record for chat messages and session state.
///
/// One call per triggering envelope; results are passed through untouched
/// apart from the identifiers the relay needs for cursor bookkeeping.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn persist_chat_message(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        draft: &Payload,
    ) -> Result<Value, BridgeError>;

    async fn get_session_status(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Value, BridgeError>;

    async fn end_session(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        reason: &str,
    ) -> Result<Value, BridgeError>;

    async fn fetch_messages_since(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        cursor: Option<MessageId>,
    ) -> Result<Vec<Value>, BridgeError>;
}

/// REST implementation of [`SessionBackend`].
pub struct HttpSessionBackend {
    client: Client,
    base_url: Url,
}

impl HttpSessionBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BridgeError> {
        let base_url =
            Url::parse(base_url).map_err(|e| BridgeError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BridgeError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BridgeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder, auth_token: Option<&str>) -> RequestBuilder {
        match auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SessionBackend for HttpSessionBackend {
    async fn persist_chat_message(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        draft: &Payload,
    ) -> Result<Value, BridgeError> {
        let url = self.endpoint(&["api", "chat", session_id, "messages"])?;
        let response = self
            .authorized(self.client.post(url), auth_token)
            .json(draft)
            .send()
            .await?;

        read_envelope::<Value>(response)
            .await?
            .ok_or_else(|| BridgeError::InvalidResponse("persisted message missing".to_string()))
    }

    async fn get_session_status(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let url = match SessionRef::classify(session_id) {
            SessionRef::TextSession(id) => self.endpoint(&["api", "text-sessions", id])?,
            SessionRef::Appointment(id) => self.endpoint(&["api", "appointments", id, "status"])?,
        };
        let response = self
            .authorized(self.client.get(url), auth_token)
            .send()
            .await?;

        Ok(read_envelope::<Value>(response).await?.unwrap_or(Value::Null))
    }

    async fn end_session(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        reason: &str,
    ) -> Result<Value, BridgeError> {
        let url = match SessionRef::classify(session_id) {
            SessionRef::TextSession(id) => self.endpoint(&["api", "text-sessions", id, "end"])?,
            SessionRef::Appointment(id) => self.endpoint(&["api", "appointments", id, "end"])?,
        };
        let response = self
            .authorized(self.client.post(url), auth_token)
            .json(&EndSessionRequest { reason })
            .send()
            .await?;

        Ok(read_envelope::<Value>(response).await?.unwrap_or(Value::Null))
    }

    async fn fetch_messages_since(
        &self,
        session_id: &str,
        auth_token: Option<&str>,
        cursor: Option<MessageId>,
    ) -> Result<Vec<Value>, BridgeError> {
        let url = self.endpoint(&["api", "chat", session_id, "messages"])?;
        let mut request = self.authorized(self.client.get(url), auth_token);
        if let Some(cursor) = cursor {
            request = request.query(&SinceQuery { since: cursor.0 });
        }
        let response = request.send().await?;

        Ok(read_envelope::<Vec<Value>>(response).await?.unwrap_or_default())
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Option<T>, BridgeError> {
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        return Err(BridgeError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let envelope: BackendEnvelope<T> = response.json().await?;
    if !envelope.success {
        return Err(BridgeError::Rejected(
            envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        ));
    }
    Ok(envelope.data)
}

/// Ordinal id of a backend message, if it has one.
pub fn message_id(message: &Value) -> Option<MessageId> {
    message.get("id").and_then(MessageId::from_value)
}

/// Keep only messages newer than `cursor`; also returns the id of the last one kept.
pub fn messages_after(
    messages: Vec<Value>,
    cursor: Option<MessageId>,
) -> (Vec<Value>, Option<MessageId>) {
    let fresh: Vec<Value> = messages
        .into_iter()
        .filter(|message| match (cursor, message_id(message)) {
            (Some(cursor), Some(id)) => id > cursor,
            _ => true,
        })
        .collect();
    let last = fresh.iter().rev().find_map(message_id);
    (fresh, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    async fn spawn_backend(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve fake backend");
        });
        format!("http://{addr}")
    }

    #[test]
    fn endpoint_appends_encoded_segments() {
        let backend =
            HttpSessionBackend::new("http://backend.local/v1/", Duration::from_secs(1)).expect("backend");
        let url = backend
            .endpoint(&["api", "chat", "room 1", "messages"])
            .expect("url");
        assert_eq!(url.as_str(), "http://backend.local/v1/api/chat/room%201/messages");

        assert!(matches!(
            HttpSessionBackend::new("not a url", Duration::from_secs(1)),
            Err(BridgeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn messages_after_filters_by_cursor() {
        let messages = vec![json!({ "id": 1 }), json!({ "id": "2" }), json!({ "id": 3 })];

        let (fresh, last) = messages_after(messages.clone(), Some(MessageId(1)));
        assert_eq!(fresh, vec![json!({ "id": "2" }), json!({ "id": 3 })]);
        assert_eq!(last, Some(MessageId(3)));

        let (all, last) = messages_after(messages, None);
        assert_eq!(all.len(), 3);
        assert_eq!(last, Some(MessageId(3)));

        let (none, last) = messages_after(vec![json!({ "id": 3 })], Some(MessageId(3)));
        assert!(none.is_empty());
        assert_eq!(last, None);
    }

    #[tokio::test]
    async fn maps_backend_responses_to_results() {
        let router = Router::new()
            .route(
                "/api/chat/:session/messages",
                post(|Path(session): Path<String>, Json(draft): Json<Value>| async move {
                    if session == "broken" {
                        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" })));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({ "success": true, "data": { "id": 42, "draft": draft } })),
                    )
                })
                .get(|| async { Json(json!({ "success": true, "data": null })) }),
            )
            .route(
                "/api/text-sessions/:id/end",
                post(|| async { Json(json!({ "success": false, "message": "already ended" })) }),
            )
            .route(
                "/api/appointments/:id/status",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!({ "success": true, "data": {} }))
                }),
            );
        let base = spawn_backend(router).await;
        let backend = HttpSessionBackend::new(&base, Duration::from_millis(300)).expect("backend");
        let draft = json!({ "message": "hi" }).as_object().cloned().expect("object");

        let persisted = backend
            .persist_chat_message("S1", Some("token"), &draft)
            .await
            .expect("persisted");
        assert_eq!(persisted["id"], 42);
        assert_eq!(persisted["draft"]["message"], "hi");

        assert!(matches!(
            backend.persist_chat_message("broken", None, &draft).await,
            Err(BridgeError::Status { status: 500, .. })
        ));
        assert!(backend
            .fetch_messages_since("S1", None, Some(MessageId(5)))
            .await
            .expect("empty history")
            .is_empty());
        assert!(matches!(
            backend.end_session("text_session_3", None, "done").await,
            Err(BridgeError::Rejected(message)) if message == "already ended"
        ));
        assert!(matches!(
            backend.get_session_status("77", None).await,
            Err(BridgeError::Timeout)
        ));
    }
}
