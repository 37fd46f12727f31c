//! HTTP snapshot source.
//!
//! The HTTP client itself is abstracted via a trait so any library (reqwest,
//! hyper, a browser fetch shim) can carry the requests. This module owns the
//! URL layout of the REST API and the decoding of its JSON bodies.

use crate::error::{SyncError, SyncResult};
use crate::transport::{ChildQuery, SnapshotSource};
use std::future::Future;
use std::sync::Arc;
use suitesync_protocol::{ApiErrorBody, Collection, JsonValue, Owner, ProtocolError, SnapshotPage};
use tracing::debug;
use url::Url;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// An `Err` means no response was received at all (DNS, connect, reset).
pub trait HttpClient: Send + Sync + 'static {
    /// Sends a GET request.
    fn get(&self, url: &str) -> impl Future<Output = Result<HttpResponse, String>> + Send;
}

impl<C: HttpClient> HttpClient for Arc<C> {
    fn get(&self, url: &str) -> impl Future<Output = Result<HttpResponse, String>> + Send {
        (**self).get(url)
    }
}

/// Snapshot source backed by the REST API.
#[derive(Debug)]
pub struct HttpSource<C: HttpClient> {
    base: Url,
    client: C,
}

impl<C: HttpClient> HttpSource<C> {
    /// Creates a source for the server at `base_url`.
    pub fn new(base_url: &str, client: C) -> SyncResult<Self> {
        let base = Url::parse(base_url).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { base, client })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Builds `<base>/v1/<segments...>`, percent-encoding each segment.
    fn endpoint<I>(&self, segments: I) -> SyncResult<Url>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    /// URL of a snapshot page.
    pub fn page_url(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<Url> {
        let mut url = self.endpoint([collection.as_str()])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = cursor {
                query.append_pair("from", cursor);
            }
            query.append_pair("limit", &limit.to_string());
        }
        Ok(url)
    }

    /// URL of a single entity.
    pub fn entity_url(&self, collection: Collection, id: &str) -> SyncResult<Url> {
        self.endpoint([collection.as_str(), id])
    }

    /// URL of a child listing.
    pub fn children_url(&self, query: &ChildQuery) -> SyncResult<Url> {
        match query {
            ChildQuery::SuiteCases(suite_id) => self.endpoint(["suites", suite_id.as_str(), "cases"]),
            ChildQuery::CaseLogs(case_id) => self.endpoint(["cases", case_id.as_str(), "logs"]),
            ChildQuery::Attachments(owner) => {
                let (key, id) = match owner {
                    Owner::Suite(id) => ("suite", id),
                    Owner::Case(id) => ("case", id),
                };
                let mut url = self.endpoint(["attachments"])?;
                url.query_pairs_mut().append_pair(key, id);
                Ok(url)
            }
        }
    }

    async fn get_json(&self, url: Url, context: String) -> SyncResult<JsonValue> {
        debug!(%url, "GET");
        let response = self
            .client
            .get(url.as_str())
            .await
            .map_err(|e| SyncError::transport_retryable(format!("{context}: {e}")))?;

        if !response.is_success() {
            let body = ApiErrorBody::from_response(response.status, &response.body);
            return Err(SyncError::api(body.error, context));
        }

        let value = serde_json::from_slice(&response.body).map_err(ProtocolError::from)?;
        Ok(value)
    }
}

impl<C: HttpClient> SnapshotSource for HttpSource<C> {
    async fn fetch_page(
        &self,
        collection: Collection,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SnapshotPage> {
        let url = self.page_url(collection, cursor, limit)?;
        let body = self.get_json(url, format!("fetch {collection} page")).await?;
        Ok(SnapshotPage::from_json(collection, body)?)
    }

    async fn fetch_one(&self, collection: Collection, id: &str) -> SyncResult<JsonValue> {
        let url = self.entity_url(collection, id)?;
        self.get_json(url, format!("fetch {collection}/{id}")).await
    }

    async fn fetch_children(&self, query: &ChildQuery) -> SyncResult<Vec<JsonValue>> {
        let url = self.children_url(query)?;
        match self.get_json(url, format!("fetch {query:?}")).await? {
            JsonValue::Array(rows) => Ok(rows),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(ProtocolError::decoding_failed(format!(
                "expected an array of {}, got {other}",
                query.collection()
            ))
            .into()),
        }
    }
}
