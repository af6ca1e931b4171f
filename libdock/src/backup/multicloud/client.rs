//! HTTP client for the multi-cloud gateway's S3-style object API.
//!
//! | Call | Request |
//! |---|---|
//! | init | `PUT  /v1/s3/<bucket>/<key>?uploads` |
//! | part | `PUT  /v1/s3/<bucket>/<key>?partNumber=<n>&uploadId=<id>` |
//! | complete | `PUT  /v1/s3/<bucket>/<key>?uploadId=<id>` + XML part list |
//! | abort | `DELETE /v1/s3/<bucket>/<key>?uploadId=<id>` |
//! | range | `GET  /v1/s3/<bucket>/<key>` + `Range: bytes=<a>-<b>` |
//! | remove | `DELETE /v1/s3/<bucket>/<key>` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::auth::AuthSession;
use crate::backup::store::{CompletedPart, ObjectStore};
use crate::error::DockError;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const XML_CONTENT_TYPE: &str = "application/xml";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InitiateMultipartUploadResult {
    pub(crate) upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct UploadPartResult {
    #[serde(rename = "ETag")]
    pub(crate) etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub(crate) struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    pub(crate) parts: &'a [CompletedPart],
}

pub struct MultiCloudClient {
    http: reqwest::Client,
    base: String,
    auth: AuthSession,
    upload_timeout: Duration,
}

impl MultiCloudClient {
    /// * `endpoint`: gateway root, e.g. `http://127.0.0.1:8088`
    /// * `timeout`: bound on control requests
    /// * `upload_timeout`: bound on part and range requests
    pub fn new(
        endpoint: &str,
        auth: AuthSession,
        timeout: Duration,
        upload_timeout: Duration,
    ) -> Result<Self, DockError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DockError::config)?;
        Ok(Self {
            http,
            base: format!("{}/v1", endpoint.trim_end_matches('/')),
            auth,
            upload_timeout,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/s3/{bucket}/{key}", self.base)
    }

    /// Attach the auth token and send.
    async fn execute(&self, req: RequestBuilder) -> Result<Response, DockError> {
        let req = match self.auth.token(&self.http).await? {
            Some(token) => req.header(AUTH_TOKEN_HEADER, token),
            None => req,
        };
        req.send().await.map_err(DockError::transport)
    }

    /// Map non-success statuses to error kinds.
    async fn check(&self, resp: Response) -> Result<Response, DockError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.auth.invalidate().await;
                Err(DockError::Auth(format!("gateway answered {status}: {body}")))
            }
            StatusCode::NOT_FOUND => Err(DockError::NotFound(format!("gateway answered {status}: {body}"))),
            _ => Err(DockError::Backend(format!("gateway answered {status}: {body}"))),
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, DockError> {
        let resp = self.execute(req).await?;
        self.check(resp).await
    }
}

fn parse_xml<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, DockError> {
    quick_xml::de::from_str(body).map_err(|e| DockError::Backend(format!("malformed gateway reply: {e}")))
}

#[async_trait]
impl ObjectStore for MultiCloudClient {
    #[instrument(skip(self))]
    async fn init_multipart(&self, bucket: &str, key: &str) -> Result<String, DockError> {
        let url = format!("{}?uploads", self.object_url(bucket, key));
        let body = self
            .send(self.http.put(&url))
            .await?
            .text()
            .await
            .map_err(DockError::transport)?;
        let result: InitiateMultipartUploadResult = parse_xml(&body)?;
        Ok(result.upload_id)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, DockError> {
        let url = self.object_url(bucket, key);
        let resp = self
            .send(
                self.http
                    .put(&url)
                    .query(&[("partNumber", part_number.to_string()), ("uploadId", upload_id.to_owned())])
                    .timeout(self.upload_timeout)
                    .body(data.to_vec()),
            )
            .await?;
        let header_etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.text().await.map_err(DockError::transport)?;
        match parse_xml::<UploadPartResult>(&body) {
            Ok(result) => Ok(result.etag),
            Err(e) => header_etag.ok_or(e),
        }
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DockError> {
        let xml = quick_xml::se::to_string(&CompleteMultipartUpload { parts })
            .map_err(|e| DockError::Backend(format!("encode part list: {e}")))?;
        let url = self.object_url(bucket, key);
        self.send(
            self.http
                .put(&url)
                .query(&[("uploadId", upload_id)])
                .header(CONTENT_TYPE, XML_CONTENT_TYPE)
                .body(xml),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), DockError> {
        let url = self.object_url(bucket, key);
        match self
            .send(self.http.delete(&url).query(&[("uploadId", upload_id)]))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn download_part(&self, bucket: &str, key: &str, offset: u64, size: u64) -> Result<Vec<u8>, DockError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let range = format!("bytes={}-{}", offset, offset + size - 1);
        let resp = self
            .execute(
                self.http
                    .get(self.object_url(bucket, key))
                    .header(RANGE, range)
                    .timeout(self.upload_timeout),
            )
            .await?;
        if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(offset, "range past end of object");
            return Ok(Vec::new());
        }
        let resp = self.check(resp).await?;
        let bytes = resp.bytes().await.map_err(DockError::transport)?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self))]
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), DockError> {
        match self.send(self.http.delete(self.object_url(bucket, key))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
