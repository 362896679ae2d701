//! REST boundary to the sync server.
//!
//! - `GET  /api/<collection>`       → `[{ id, ...summary }]`
//! - `GET  /api/<collection>/<id>`  → full document (404 = gone)
//! - `POST /api/sync`               → full overwrite, guarded by `X-Confirm`

use crate::{error::Result, Entity, Error};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Header value the server requires before it overwrites a collection.
pub const CONFIRM_OVERWRITE: &str = "overwrite-all";

/// Header carrying [`CONFIRM_OVERWRITE`].
pub const CONFIRM_HEADER: &str = "X-Confirm";

/// Body of a full-overwrite push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    /// Target collection; servers fall back to their default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Every document of the collection
    pub items: Vec<Value>,
}

/// Network operations the sync coordinator needs.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// List summaries of every remote document in `collection`.
    async fn list(&self, collection: &str) -> Result<Vec<Value>>;

    /// Fetch one full document. `Ok(None)` when the server no longer has it.
    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Replace the server's copy of `collection` with `items`.
    async fn push_all(&self, collection: &str, items: &[Entity]) -> Result<()>;
}

/// [`RemoteApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
}

impl HttpRemote {
    /// Create a remote rooted at `base` (e.g. `http://127.0.0.1:3000`).
    pub fn new(base: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    /// Create a remote with a preconfigured client.
    pub fn with_client(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    /// Base URL requests are resolved against.
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("base URL cannot have a path: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list(&self, collection: &str) -> Result<Vec<Value>> {
        let url = self.endpoint(&["api", collection])?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let url = self.endpoint(&["api", collection, id])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }

    async fn push_all(&self, collection: &str, items: &[Entity]) -> Result<()> {
        let url = self.endpoint(&["api", "sync"])?;
        let body = PushBody {
            collection: Some(collection.to_string()),
            items: items.iter().map(|e| e.as_value().clone()).collect(),
        };
        self.client
            .post(url)
            .header(CONFIRM_HEADER, CONFIRM_OVERWRITE)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_are_joined_under_base_path() {
        let remote = HttpRemote::new(Url::parse("http://localhost:3000").unwrap());
        assert_eq!(
            remote.endpoint(&["api", "projects"]).unwrap().as_str(),
            "http://localhost:3000/api/projects"
        );

        let remote = HttpRemote::new(Url::parse("http://localhost:3000/tenant/").unwrap());
        assert_eq!(
            remote.endpoint(&["api", "projects", "p 1"]).unwrap().as_str(),
            "http://localhost:3000/tenant/api/projects/p%201"
        );
    }

    #[test]
    fn push_body_shape() {
        let body = PushBody {
            collection: Some("projects".into()),
            items: vec![json!({"id": "p1"})],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"collection": "projects", "items": [{"id": "p1"}]})
        );

        let parsed: PushBody = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert_eq!(parsed.collection, None);
    }

    #[test]
    fn non_hierarchical_base_is_a_config_error() {
        let remote = HttpRemote::new(Url::parse("mailto:ops@example.com").unwrap());
        assert!(matches!(
            remote.endpoint(&["api"]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        // Port 9 (discard) on localhost is almost never listening.
        let remote = HttpRemote::new(Url::parse("http://127.0.0.1:9").unwrap());
        let err = remote.list("projects").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
