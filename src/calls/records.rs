//! Client for the call record service.
//!
//! The service is the source of truth for call identity: the engine only
//! learns a call id from the `POST /calls/offer` response or from an
//! `incoming-call` event.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::debug;
use peercall_core::net::{HttpClient, HttpRequest};
use peercall_core::{CallId, CallRecord, CallType, ConversationId, SessionDescription};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /calls/offer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub offer: SessionDescription,
}

#[derive(Debug, Deserialize)]
struct OfferResponse {
    call: CallRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerRequest<'a> {
    call_id: &'a CallId,
    answer: &'a SessionDescription,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallIdRequest<'a> {
    call_id: &'a CallId,
}

#[async_trait]
pub trait CallRecordService: Send + Sync {
    /// Persists a new call attempt and relays it to the receiver.
    async fn create_offer(&self, request: &OfferRequest) -> Result<CallRecord>;

    async fn answer(&self, call_id: &CallId, answer: &SessionDescription) -> Result<()>;

    async fn reject(&self, call_id: &CallId) -> Result<()>;

    async fn end(&self, call_id: &CallId) -> Result<()>;
}

/// [`CallRecordService`] over the REST API.
pub struct RestCallRecordService {
    http: Arc<dyn HttpClient>,
    base_url: String,
    credential: String,
}

impl RestCallRecordService {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let request = HttpRequest::post(url)
            .with_bearer(&self.credential)
            .with_json(body)?;
        let response = self.http.execute(request).await?;
        if !response.is_success() {
            return Err(anyhow!(
                "{} failed with status {}: {}",
                path,
                response.status_code,
                response.body_string()
            ));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl CallRecordService for RestCallRecordService {
    async fn create_offer(&self, request: &OfferRequest) -> Result<CallRecord> {
        let body = self.post("/calls/offer", request).await?;
        let response: OfferResponse = serde_json::from_slice(&body)?;
        if response.call.id.as_str().is_empty() {
            return Err(anyhow!("call record service returned an empty call id"));
        }
        Ok(response.call)
    }

    async fn answer(&self, call_id: &CallId, answer: &SessionDescription) -> Result<()> {
        self.post("/calls/answer", &AnswerRequest { call_id, answer })
            .await
            .map(drop)
    }

    async fn reject(&self, call_id: &CallId) -> Result<()> {
        self.post("/calls/reject", &CallIdRequest { call_id })
            .await
            .map(drop)
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        self.post("/calls/end", &CallIdRequest { call_id })
            .await
            .map(drop)
    }
}
