//! REST client for the authoritative action ledger.

use std::time::Duration;

use agent_sync_core::{ActionId, ActionSource, BatchItemResult, PendingAction, SourceError};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

#[derive(Deserialize)]
#[serde(untagged)]
enum PendingList {
    Bare(Vec<PendingAction>),
    Wrapped { actions: Vec<PendingAction> },
}

impl PendingList {
    fn into_vec(self) -> Vec<PendingAction> {
        match self {
            Self::Bare(actions) | Self::Wrapped { actions } => actions,
        }
    }
}

#[derive(Serialize)]
struct RejectBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    ids: &'a [ActionId],
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// `ActionSource` over the backend's HTTP API.
///
/// Endpoints are resolved relative to the base URL:
/// `actions/pending`, `actions/{id}/approve`, `actions/{id}/reject`,
/// `actions/batch/approve`, `actions/batch/reject`.
pub struct RestActionSource {
    http: reqwest::Client,
    base: Url,
    credential: RwLock<Option<String>>,
}

impl std::fmt::Debug for RestActionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestActionSource")
            .field("base", &self.base)
            .field("credential", &self.credential.read().as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl RestActionSource {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::RequestFailed(format!("HTTP client: {e}")))?;
        Self::with_client(http, base_url)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or cannot hold a path.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, SourceError> {
        let base = Url::parse(base_url)
            .map_err(|e| SourceError::RequestFailed(format!("invalid base URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SourceError::RequestFailed(format!(
                "{base_url} cannot be a base URL"
            )));
        }
        Ok(Self {
            http,
            base,
            credential: RwLock::new(None),
        })
    }

    /// Set the bearer credential sent with every request.
    #[must_use]
    pub fn with_credential(self, credential: impl Into<String>) -> Self {
        *self.credential.write() = Some(credential.into());
        self
    }

    /// Replace or clear the bearer credential.
    pub fn set_credential(&self, credential: Option<String>) {
        *self.credential.write() = credential;
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.http.request(method, self.endpoint(segments));
        match self.credential.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(
        &self,
        builder: RequestBuilder,
        id: Option<&ActionId>,
    ) -> Result<reqwest::Response, SourceError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(%status, body, "Action source request failed");
        Err(map_status(status, id, body))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, SourceError> {
        self.execute(builder, None)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::RequestFailed(format!("invalid response body: {e}")))
    }
}

fn map_status(status: StatusCode, id: Option<&ActionId>, body: String) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized,
        StatusCode::NOT_FOUND => match id {
            Some(id) => SourceError::NotFound(id.clone()),
            None => SourceError::RequestFailed(format!("{status}: {body}")),
        },
        s if s.is_server_error() => SourceError::Unavailable(format!("{status}: {body}")),
        _ => SourceError::RequestFailed(format!("{status}: {body}")),
    }
}

#[async_trait]
impl ActionSource for RestActionSource {
    async fn list_pending(&self) -> Result<Vec<PendingAction>, SourceError> {
        let list: PendingList = self
            .execute_json(self.request(Method::GET, &["actions", "pending"]))
            .await?;
        Ok(list.into_vec())
    }

    async fn approve(&self, id: &ActionId) -> Result<(), SourceError> {
        let builder = self.request(Method::POST, &["actions", id.as_str(), "approve"]);
        self.execute(builder, Some(id)).await?;
        tracing::debug!(action_id = %id, "Approved via REST");
        Ok(())
    }

    async fn reject(&self, id: &ActionId, reason: Option<&str>) -> Result<(), SourceError> {
        let builder = self
            .request(Method::POST, &["actions", id.as_str(), "reject"])
            .json(&RejectBody { reason });
        self.execute(builder, Some(id)).await?;
        tracing::debug!(action_id = %id, "Rejected via REST");
        Ok(())
    }

    async fn batch_approve(&self, ids: &[ActionId]) -> Result<Vec<BatchItemResult>, SourceError> {
        let builder = self
            .request(Method::POST, &["actions", "batch", "approve"])
            .json(&BatchBody { ids, reason: None });
        self.execute_json(builder).await
    }

    async fn batch_reject(
        &self,
        ids: &[ActionId],
        reason: Option<&str>,
    ) -> Result<Vec<BatchItemResult>, SourceError> {
        let builder = self
            .request(Method::POST, &["actions", "batch", "reject"])
            .json(&BatchBody { ids, reason });
        self.execute_json(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_resolve_under_base_path() {
        let source = RestActionSource::new("http://localhost:3000/api/").unwrap();
        assert_eq!(
            source.endpoint(&["actions", "pending"]).as_str(),
            "http://localhost:3000/api/actions/pending"
        );

        let bare = RestActionSource::new("http://localhost:3000/api").unwrap();
        assert_eq!(
            bare.endpoint(&["actions", "a/1", "approve"]).as_str(),
            "http://localhost:3000/api/actions/a%2F1/approve"
        );
    }

    #[test]
    fn test_rejects_unusable_base() {
        tokio_test::assert_err!(RestActionSource::new("not a url"));
        tokio_test::assert_err!(RestActionSource::new("mailto:ops@example.com"));
    }

    #[test]
    fn test_status_mapping() {
        let id = ActionId::from("a1");
        assert_eq!(
            map_status(StatusCode::FORBIDDEN, Some(&id), String::new()),
            SourceError::Unauthorized
        );
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, Some(&id), String::new()),
            SourceError::NotFound(id)
        );
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, None, "down".into()),
            SourceError::Unavailable(_)
        ));
    }

    #[test]
    fn test_pending_list_accepts_both_shapes() {
        let bare: PendingList = serde_json::from_str(r#"[{"id":"a1","toolName":"bash"}]"#).unwrap();
        let wrapped: PendingList =
            serde_json::from_str(r#"{"actions":[{"id":"a1","toolName":"bash"}]}"#).unwrap();
        assert_eq!(bare.into_vec(), wrapped.into_vec());
    }
}
