//! Remote store client
//!
//! The multipart-upload surface the pipeline needs from an S3-compatible
//! store, behind the [`RemoteStore`] trait so tests can substitute an
//! in-memory fake. [`S3RemoteStore`] is the aws-sdk-s3 implementation.
//!
//! All operations are instrumented with tracing spans carrying the bucket,
//! key, and upload id.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;
use thiserror::Error;

use crate::config::S3Config;

/// Content type stamped on every exported object.
pub const CONTENT_TYPE: &str = "application/x-gzip";

/// ACL applied when the configuration leaves it unset.
pub const DEFAULT_ACL: &str = "bucket-owner-full-control";

/// Remote store errors
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("{op} failed: {message}")]
    Api { op: &'static str, message: String },

    #[error("invalid response from store: {0}")]
    Response(String),
}

impl RemoteError {
    fn api(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Api {
            op,
            message: err.to_string(),
        }
    }
}

/// Destination object identity.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub bucket: String,
    pub key: String,
    pub acl: String,
}

impl RemoteTarget {
    pub fn from_config(s3: &S3Config) -> Self {
        Self {
            bucket: s3.bucket.clone(),
            key: s3.path.clone(),
            acl: s3
                .acl
                .clone()
                .unwrap_or_else(|| DEFAULT_ACL.to_string()),
        }
    }
}

/// An open multipart upload. Created once per invocation, then either
/// completed or aborted exactly once.
#[derive(Debug, Clone)]
pub struct MultipartSession {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub etag: String,
}

/// Multipart-capable object store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_multipart_upload(
        &self,
        target: &RemoteTarget,
    ) -> Result<MultipartSession, RemoteError>;

    /// Idempotent per attempt; the upload worker retries this call.
    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, RemoteError>;

    async fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPartInfo],
    ) -> Result<(), RemoteError>;

    async fn abort_multipart_upload(&self, session: &MultipartSession) -> Result<(), RemoteError>;

    /// Direct path for objects that never reached the part threshold.
    async fn put_object(&self, target: &RemoteTarget, body: Bytes) -> Result<(), RemoteError>;
}

/// aws-sdk-s3 backed store.
pub struct S3RemoteStore {
    client: aws_sdk_s3::Client,
}

impl S3RemoteStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Build a client from the export configuration's S3 section.
    pub async fn from_config(s3: &S3Config) -> Result<Self, RemoteError> {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(s3.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &s3.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, target),
        fields(s3.bucket = %target.bucket, s3.key = %target.key),
        err
    )]
    async fn create_multipart_upload(
        &self,
        target: &RemoteTarget,
    ) -> Result<MultipartSession, RemoteError> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .acl(ObjectCannedAcl::from(target.acl.as_str()))
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| RemoteError::api("CreateMultipartUpload", e))?;

        let upload_id = resp
            .upload_id()
            .ok_or_else(|| RemoteError::Response("missing upload id".into()))?
            .to_string();

        tracing::info!(upload_id = %upload_id, "created multipart upload");

        Ok(MultipartSession {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            upload_id,
        })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, session, body),
        fields(
            s3.bucket = %session.bucket,
            s3.upload_id = %session.upload_id,
            s3.part_number = part_number,
            upload.bytes = body.len()
        ),
        err
    )]
    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, RemoteError> {
        let resp = self
            .client
            .upload_part()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| RemoteError::api("UploadPart", e))?;

        let etag = resp
            .e_tag()
            .ok_or_else(|| RemoteError::Response("missing part etag".into()))?
            .to_string();

        tracing::info!(etag = %etag, part_number = part_number, "uploaded part");
        Ok(etag)
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, session, parts),
        fields(
            s3.bucket = %session.bucket,
            s3.upload_id = %session.upload_id,
            parts_count = parts.len()
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPartInfo],
    ) -> Result<(), RemoteError> {
        let completed = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| RemoteError::api("CompleteMultipartUpload", e))?;

        tracing::info!(parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self, session),
        fields(s3.bucket = %session.bucket, s3.upload_id = %session.upload_id),
        err
    )]
    async fn abort_multipart_upload(&self, session: &MultipartSession) -> Result<(), RemoteError> {
        self.client
            .abort_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(|e| RemoteError::api("AbortMultipartUpload", e))?;

        tracing::info!("aborted multipart upload");
        Ok(())
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, target, body),
        fields(
            s3.bucket = %target.bucket,
            s3.key = %target.key,
            upload.bytes = body.len()
        ),
        err
    )]
    async fn put_object(&self, target: &RemoteTarget, body: Bytes) -> Result<(), RemoteError> {
        self.client
            .put_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .acl(ObjectCannedAcl::from(target.acl.as_str()))
            .content_type(CONTENT_TYPE)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| RemoteError::api("PutObject", e))?;

        tracing::info!("put object completed");
        Ok(())
    }
}
