//! Community background catalog
//!
//! Fetches the manifest of available backgrounds, per-image metadata
//! documents and image binaries from the remote catalog.

use async_trait::async_trait;
use rand::seq::index;
use rand::Rng;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::cache::ImageId;
use crate::error::CatalogError;

/// Manifest filename, relative to the catalog base
const MANIFEST_FILE: &str = "backgrounds.json";

/// Number of images downloaded per catalog refresh
pub const SAMPLE_SIZE: usize = 10;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent sent with every catalog request
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// List of metadata document paths, header entry already removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogManifest {
    entries: Vec<String>,
}

impl CatalogManifest {
    /// Parse a manifest body: a JSON array whose first element is a version
    /// marker and whose remaining elements are path strings
    pub fn from_slice(data: &[u8]) -> Result<Self, CatalogError> {
        let values: Vec<Value> = serde_json::from_slice(data)?;

        let entries = values
            .into_iter()
            .skip(1)
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(CatalogError::Parse(format!(
                    "manifest entry is not a string: {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick `min(count, len)` distinct entries uniformly at random
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, count: usize) -> Vec<String> {
        let amount = count.min(self.entries.len());
        index::sample(rng, self.entries.len(), amount)
            .into_iter()
            .map(|i| self.entries[i].clone())
            .collect()
    }
}

/// Metadata document for one community background
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Any other fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageMetadata {
    pub fn from_slice(data: &[u8]) -> Result<Self, CatalogError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn image_id(&self) -> Result<ImageId, CatalogError> {
        ImageId::from_filename(&self.filename).map_err(|e| CatalogError::Parse(e.to_string()))
    }
}

/// A metadata document together with the exact bytes it was parsed from
#[derive(Debug, Clone)]
pub struct FetchedMetadata {
    pub image_id: ImageId,
    pub metadata: ImageMetadata,
    pub raw: Vec<u8>,
}

/// Remote catalog operations used by the rotation engine
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the list of available backgrounds
    async fn fetch_manifest(&self) -> Result<CatalogManifest, CatalogError>;

    /// Fetch one metadata document by its manifest path
    async fn fetch_metadata(&self, path: &str) -> Result<FetchedMetadata, CatalogError>;

    /// Fetch the image binary described by `metadata`
    async fn fetch_image(&self, metadata: &ImageMetadata) -> Result<Vec<u8>, CatalogError>;
}

/// Catalog served over HTTP(S)
pub struct HttpCatalog {
    client: Client,
    base: Url,
}

impl HttpCatalog {
    pub fn new(base: &str) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(10))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base: parse_base(base)?,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn resolve(&self, path: &str) -> Result<Url, CatalogError> {
        self.base
            .join(path)
            .map_err(|e| CatalogError::Url(format!("{}: {}", path, e)))
    }

    fn image_url(&self, metadata: &ImageMetadata) -> Result<Url, CatalogError> {
        let id = metadata.image_id()?;
        self.resolve(&format!("{}/{}", id, metadata.filename))
    }

    async fn get_bytes(&self, url: Url, accept: &str) -> Result<Vec<u8>, CatalogError> {
        tracing::debug!("GET {}", url);

        let response = self.client.get(url).header("Accept", accept).send().await?;

        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl CatalogClient for HttpCatalog {
    async fn fetch_manifest(&self) -> Result<CatalogManifest, CatalogError> {
        let url = self.resolve(MANIFEST_FILE)?;
        tracing::info!("Fetching background manifest from: {}", url);

        let data = self.get_bytes(url, "application/json").await?;
        let manifest = CatalogManifest::from_slice(&data)?;

        tracing::info!("Manifest lists {} backgrounds", manifest.entries().len());
        Ok(manifest)
    }

    async fn fetch_metadata(&self, path: &str) -> Result<FetchedMetadata, CatalogError> {
        let url = self.resolve(path)?;
        let raw = self.get_bytes(url, "application/json").await?;
        let metadata = ImageMetadata::from_slice(&raw)?;

        Ok(FetchedMetadata {
            image_id: metadata.image_id()?,
            metadata,
            raw,
        })
    }

    async fn fetch_image(&self, metadata: &ImageMetadata) -> Result<Vec<u8>, CatalogError> {
        let url = self.image_url(metadata)?;
        tracing::info!("Fetching background image from: {}", url);

        let data = self.get_bytes(url, "image/*").await?;
        image::guess_format(&data).map_err(|e| {
            CatalogError::Parse(format!("{} is not an image: {}", metadata.filename, e))
        })?;

        Ok(data)
    }
}

/// Parse the catalog base, making sure relative paths resolve beneath it
fn parse_base(base: &str) -> Result<Url, CatalogError> {
    let normalized = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };

    Url::parse(&normalized).map_err(|e| CatalogError::Url(format!("{}: {}", base, e)))
}
