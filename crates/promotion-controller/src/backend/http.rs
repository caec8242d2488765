//! Client for the Image Registry Service

use async_trait::async_trait;
use promotion_common::{
    CreateVersionRequest, Environment, Error, FleetGroup, Image, ImageFilter, InstanceRefresh,
    LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences, Result, TemplateVersion,
    image::TAG_QUERY_PREFIX,
};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ControlPlane, FleetApi, ImageRegistry, LaunchTemplateApi};

#[derive(Debug, Deserialize)]
struct ImagesListResponse {
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct TemplatesListResponse {
    templates: Vec<LaunchTemplate>,
}

#[derive(Debug, Deserialize)]
struct FleetsListResponse {
    fleets: Vec<FleetGroup>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    refresh: InstanceRefresh,
}

#[derive(Debug, Deserialize)]
struct ReleaseLeaseResponse {
    released: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct SetTagsRequest<'a> {
    tags: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct SetDefaultVersionRequest {
    version: u32,
}

#[derive(Serialize)]
struct AcquireLeaseRequest<'a> {
    holder: &'a str,
    ttl_secs: u64,
}

fn tag_query(tags: &BTreeMap<String, String>) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| (format!("{}{}", TAG_QUERY_PREFIX, k), v.clone()))
        .collect()
}

/// HTTP backend speaking to the registry's region-scoped API
pub struct HttpBackend {
    base_url: Url,
    region: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpBackend {
    /// Create a new registry client
    pub fn new(registry_url: &str, region: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Backend(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: Url::parse(registry_url)
                .map_err(|e| Error::Backend(format!("Invalid registry URL {}: {}", registry_url, e)))?,
            region: region.to_string(),
            client,
            max_retries,
        })
    }

    /// Append path segments to the base URL, percent-encoding each one
    fn join(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Backend(format!("Registry URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Region-scoped resource URL
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut path = vec!["api", "regions", self.region.as_str()];
        path.extend_from_slice(segments);
        self.join(&path)
    }

    /// Send a request. Only calls that are safe to repeat are retried on
    /// transport errors.
    async fn send<F>(&self, retryable: bool, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let attempts = if retryable { self.max_retries + 1 } else { 1 };
        let mut attempt = 1;

        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < attempts => {
                    warn!("Registry request failed (attempt {}/{}): {}", attempt, attempts, e);
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(Error::Backend(format!("Registry request failed: {}", e))),
            }
        }
    }

    async fn error_from(response: Response) -> Error {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => "no error body".to_string(),
        };
        Error::Backend(format!("Registry returned {}: {}", status, message))
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("Failed to parse registry response: {}", e)))
    }

    /// Like [`HttpBackend::parse`], mapping 404 to None
    async fn parse_optional<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse(response).await.map(Some)
    }

    /// Check if registry is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let url = self.join(&["health"])?;
        let response = self.send(true, || self.client.get(url.clone())).await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl ImageRegistry for HttpBackend {
    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<Image>> {
        let url = self.url(&["images"])?;
        let query = filter.to_query_pairs();
        debug!("Listing images: {} {:?}", url, query);

        let response = self
            .send(true, || self.client.get(url.clone()).query(&query))
            .await?;
        let list: ImagesListResponse = Self::parse(response).await?;
        Ok(list.images)
    }

    async fn get_image(&self, id: &str) -> Result<Option<Image>> {
        let url = self.url(&["images", id])?;
        debug!("Fetching image: {}", url);

        let response = self.send(true, || self.client.get(url.clone())).await?;
        Self::parse_optional(response).await
    }

    async fn set_tags(&self, id: &str, tags: BTreeMap<String, String>) -> Result<()> {
        let url = self.url(&["images", id, "tags"])?;
        let body = SetTagsRequest { tags: &tags };

        let response = self
            .send(true, || self.client.put(url.clone()).json(&body))
            .await?;
        let _: Image = Self::parse(response).await?;
        Ok(())
    }
}

#[async_trait]
impl LaunchTemplateApi for HttpBackend {
    async fn find_templates(&self, tags: &BTreeMap<String, String>) -> Result<Vec<LaunchTemplate>> {
        let url = self.url(&["launch-templates"])?;
        let query = tag_query(tags);

        let response = self
            .send(true, || self.client.get(url.clone()).query(&query))
            .await?;
        let list: TemplatesListResponse = Self::parse(response).await?;
        Ok(list.templates)
    }

    async fn create_version(
        &self,
        template_id: &str,
        request: CreateVersionRequest,
    ) -> Result<TemplateVersion> {
        let url = self.url(&["launch-templates", template_id, "versions"])?;
        // Retrying is only safe when the registry can deduplicate
        let retryable = request.client_token.is_some();

        let response = self
            .send(retryable, || self.client.post(url.clone()).json(&request))
            .await?;
        Self::parse(response).await
    }

    async fn set_default_version(&self, template_id: &str, version: u32) -> Result<()> {
        let url = self.url(&["launch-templates", template_id, "default-version"])?;
        let body = SetDefaultVersionRequest { version };

        let response = self
            .send(true, || self.client.put(url.clone()).json(&body))
            .await?;
        let _: LaunchTemplate = Self::parse(response).await?;
        Ok(())
    }
}

#[async_trait]
impl FleetApi for HttpBackend {
    async fn find_fleets(&self, tags: &BTreeMap<String, String>) -> Result<Vec<FleetGroup>> {
        let url = self.url(&["fleet-groups"])?;
        let query = tag_query(tags);

        let response = self
            .send(true, || self.client.get(url.clone()).query(&query))
            .await?;
        let list: FleetsListResponse = Self::parse(response).await?;
        Ok(list.fleets)
    }

    async fn start_instance_refresh(
        &self,
        fleet_id: &str,
        preferences: &RefreshPreferences,
    ) -> Result<InstanceRefresh> {
        let url = self.url(&["fleet-groups", fleet_id, "instance-refreshes"])?;

        let response = self
            .send(false, || self.client.post(url.clone()).json(preferences))
            .await?;
        let started: RefreshResponse = Self::parse(response).await?;
        Ok(started.refresh)
    }

    async fn describe_instance_refresh(
        &self,
        fleet_id: &str,
        refresh_id: &str,
    ) -> Result<Option<InstanceRefresh>> {
        let url = self.url(&["fleet-groups", fleet_id, "instance-refreshes", refresh_id])?;

        let response = self.send(true, || self.client.get(url.clone())).await?;
        Self::parse_optional(response).await
    }
}

#[async_trait]
impl ControlPlane for HttpBackend {
    async fn get_pointer(&self, environment: Environment) -> Result<Option<ProductionPointer>> {
        let url = self.url(&["pointers", environment.as_str()])?;

        let response = self.send(true, || self.client.get(url.clone())).await?;
        Self::parse_optional(response).await
    }

    async fn set_pointer(&self, pointer: &ProductionPointer) -> Result<()> {
        let url = self.url(&["pointers", pointer.environment.as_str()])?;

        let response = self
            .send(true, || self.client.put(url.clone()).json(pointer))
            .await?;
        let _: ProductionPointer = Self::parse(response).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        environment: Environment,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let url = self.url(&["leases", environment.as_str()])?;
        let body = AcquireLeaseRequest {
            holder,
            ttl_secs: ttl.as_secs().max(1),
        };

        // Re-acquiring with the same holder only extends the lease
        let response = self
            .send(true, || self.client.post(url.clone()).json(&body))
            .await?;
        Self::parse(response).await
    }

    async fn release_lease(&self, environment: Environment, holder: &str) -> Result<bool> {
        let url = self.url(&["leases", environment.as_str()])?;

        let response = self
            .send(true, || self.client.delete(url.clone()).query(&[("holder", holder)]))
            .await?;
        let released: ReleaseLeaseResponse = Self::parse(response).await?;
        Ok(released.released)
    }
}
