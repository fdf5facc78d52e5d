use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{Client, primitives::ByteStream};

use crate::{
    models::MessageId,
    store::{MessageStore, StoreError},
};

/// S3-compatible store. Bodies are single objects at `<prefix><message_id>`;
/// a single-request PUT gives the same all-or-nothing visibility the local
/// backend gets from rename.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    pub async fn new(
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            // MinIO and friends want path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix,
        }
    }

    fn key_for(&self, id: MessageId) -> String {
        format!("{}{id}", self.prefix)
    }
}

#[async_trait]
impl MessageStore for S3Store {
    async fn put(&self, id: MessageId, bytes: &[u8]) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key_for(id))
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Vec<u8>, StoreError> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(id))
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        };

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        // S3 DeleteObject on a missing key already succeeds
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key_for(id))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }
}
