//! S3-compatible [`ObjectStore`] backend.
//!
//! Maps HTTP failures onto the workspace error kinds: 404 becomes
//! [`NotFound`], any 5xx becomes [`Transient`] so the blob layer's backoff
//! applies, and everything else is fatal as-is.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use s3::{Bucket, Region, creds::Credentials, error::S3Error};

use backhaul_core::error::{NotFound, Transient};
use backhaul_core::{ObjectStore, Result};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services; AWS when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub access_key_secret: String,
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn create(config: S3StoreConfig) -> Result<Self> {
        let region = match config.endpoint {
            Some(endpoint) => Region::Custom {
                endpoint,
                region: config.region,
            },
            None => config
                .region
                .parse()
                .with_context(|| format!("invalid region {:?}", config.region))?,
        };
        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(&config.access_key_secret),
            None,
            None,
            None,
        )
        .context("building credentials")?;
        let bucket = Bucket::new(&config.bucket, region, credentials)
            .context("opening bucket")?
            .with_path_style();
        Ok(Self { bucket })
    }
}

fn classify(err: S3Error) -> anyhow::Error {
    match &err {
        S3Error::HttpFailWithBody(code, _) if *code >= 500 => {
            anyhow::Error::new(Transient(format!("http status {code}")))
        }
        S3Error::HttpFailWithBody(404, _) => NotFound.into(),
        _ => err.into(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.bucket
            .put_object(name, &data)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let response = self.bucket.get_object(name).await.map_err(classify)?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match self.bucket.head_object(name).await {
            Ok((_, 200)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, code)) if code >= 500 => Err(Transient(format!("http status {code}")).into()),
            Ok((_, code)) => Err(anyhow!("unexpected http status code {code}")),
            Err(err) => Err(classify(err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(classify)?;
        let mut names = Vec::new();
        for page in pages {
            names.extend(page.contents.into_iter().map(|object| object.key));
        }
        Ok(names)
    }
}
