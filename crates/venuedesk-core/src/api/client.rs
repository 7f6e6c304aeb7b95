//! API client for the administration REST backend.
//!
//! Every entity lives under `{base}/{entity path}`: list and create on the
//! collection, read/update/delete on `{collection}/{id}`. Failures come back
//! as [`RawFailure`] and are classified by the caller.

use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::models::{Entity, ListParams};

use super::error::RawFailure;

/// HTTP request timeout used when none is configured.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Query parameter carrying the free-text filter.
const SEARCH_PARAM: &str = "search";

/// API client for the administration backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity: Entity) -> String {
        format!("{}/{}", self.base_url, entity.path())
    }

    fn item_url(&self, entity: Entity, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, entity.path(), id)
    }

    /// Query string pairs for a list request.
    fn list_query(entity: Entity, params: &ListParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let (Some(field), Some(parent_id)) = (entity.parent_field(), &params.parent_id) {
            query.push((field, parent_id.clone()));
        }
        if !params.search.is_empty() {
            query.push((SEARCH_PARAM, params.search.clone()));
        }
        query
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check if response is successful, returning the parsed failure if not.
    async fn check_response(response: Response) -> Result<Response, RawFailure> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Request failed");
            Err(RawFailure::from_response(status.as_u16(), &body))
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, RawFailure> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(RawFailure::no_response)?;
        Self::check_response(response).await
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RawFailure> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(RawFailure::decode)
    }

    // ===== CRUD =====

    pub async fn list<E: DeserializeOwned>(
        &self,
        entity: Entity,
        params: &ListParams,
    ) -> Result<Vec<E>, RawFailure> {
        let url = self.collection_url(entity);
        debug!(url = %url, search = %params.search, "GET list");
        let request = self
            .client
            .get(&url)
            .query(&Self::list_query(entity, params));
        self.execute_json(request).await
    }

    pub async fn get_by_id<E: DeserializeOwned>(
        &self,
        entity: Entity,
        id: &str,
    ) -> Result<E, RawFailure> {
        let url = self.item_url(entity, id);
        debug!(url = %url, "GET");
        self.execute_json(self.client.get(&url)).await
    }

    pub async fn create<E: DeserializeOwned, D: Serialize + Sync + ?Sized>(
        &self,
        entity: Entity,
        dto: &D,
    ) -> Result<E, RawFailure> {
        let url = self.collection_url(entity);
        debug!(url = %url, "POST");
        self.execute_json(self.client.post(&url).json(dto)).await
    }

    pub async fn update<E: DeserializeOwned, D: Serialize + Sync + ?Sized>(
        &self,
        entity: Entity,
        id: &str,
        dto: &D,
    ) -> Result<E, RawFailure> {
        let url = self.item_url(entity, id);
        debug!(url = %url, "PATCH");
        self.execute_json(self.client.patch(&url).json(dto)).await
    }

    pub async fn delete(&self, entity: Entity, id: &str) -> Result<(), RawFailure> {
        let url = self.item_url(entity, id);
        debug!(url = %url, "DELETE");
        self.execute(self.client.delete(&url)).await?;
        Ok(())
    }
}
