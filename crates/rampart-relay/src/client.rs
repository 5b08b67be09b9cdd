//! REST client for the message relay.

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::records::{
    AckRequest, GroupInfoRecord, GroupMessageRequest, KeyPackagesResponse,
    PendingMessagesResponse, UploadKeyPackagesRequest, WelcomeRequest,
};
use async_trait::async_trait;
use rampart_core::{
    Envelope, GroupId, KeyPackageUpload, MessageId, MessageType, PublishedKeyPackage,
    RelayTransport,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;

/// Relay client for one device.
pub struct RelayClient {
    http: Client,
    base: Url,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(config.base_url.clone()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Base URL with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn upload(&self, packages: &[KeyPackageUpload]) -> Result<()> {
        let body = UploadKeyPackagesRequest {
            device_id: self.config.device_id.clone(),
            key_packages: packages.to_vec(),
        };
        let url = self.endpoint(&["key-packages"])?;
        check(self.request(Method::POST, url).json(&body).send().await?).await?;
        tracing::debug!(count = packages.len(), "uploaded key packages");
        Ok(())
    }

    async fn fetch(&self, user_id: &str, device_id: Option<&str>) -> Result<Vec<PublishedKeyPackage>> {
        let url = self.endpoint(&["key-packages", user_id])?;
        let mut request = self.request(Method::GET, url);
        if let Some(device_id) = device_id {
            request = request.query(&[("device_id", device_id)]);
        }
        let response: KeyPackagesResponse = check(request.send().await?).await?.json().await?;
        tracing::debug!(user = user_id, count = response.key_packages.len(), "fetched key packages");
        Ok(response.key_packages)
    }

    async fn send_message(
        &self,
        group_id: &GroupId,
        epoch: u64,
        message_type: MessageType,
        data: &[u8],
        exclude_user_ids: &[String],
    ) -> Result<()> {
        let body = GroupMessageRequest {
            sender_device_id: self.config.device_id.clone(),
            epoch,
            message_type,
            data: data.to_vec(),
            exclude_user_ids: exclude_user_ids.to_vec(),
        };
        let url = self.endpoint(&["groups", &group_id.to_hex(), "messages"])?;
        check(self.request(Method::POST, url).json(&body).send().await?).await?;
        tracing::debug!(group = %group_id, epoch, kind = message_type.as_str(), "enqueued group message");
        Ok(())
    }

    async fn welcome(
        &self,
        group_id: &GroupId,
        receiver_user_id: &str,
        welcome: &[u8],
        group_info: Option<&[u8]>,
    ) -> Result<()> {
        let body = WelcomeRequest {
            sender_device_id: self.config.device_id.clone(),
            receiver_user_id: receiver_user_id.to_string(),
            welcome: welcome.to_vec(),
            group_info: group_info.map(<[u8]>::to_vec),
        };
        let url = self.endpoint(&["groups", &group_id.to_hex(), "welcome"])?;
        check(self.request(Method::POST, url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Envelope>> {
        let url = self.endpoint(&["messages", "pending"])?;
        let request = self
            .request(Method::GET, url)
            .query(&[("device_id", self.config.device_id.as_str())]);
        let response: PendingMessagesResponse = check(request.send().await?).await?.json().await?;
        Ok(response.messages)
    }

    async fn ack(&self, ids: &[MessageId]) -> Result<()> {
        let body = AckRequest {
            device_id: self.config.device_id.clone(),
            message_ids: ids.to_vec(),
        };
        let url = self.endpoint(&["messages", "ack"])?;
        check(self.request(Method::POST, url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn fetch_group_info(&self, group_id: &GroupId) -> Result<Option<Vec<u8>>> {
        let url = self.endpoint(&["groups", &group_id.to_hex(), "group-info"])?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: GroupInfoRecord = check(response).await?.json().await?;
        Ok(Some(record.group_info))
    }

    async fn publish_group_info(&self, group_id: &GroupId, epoch: u64, group_info: &[u8]) -> Result<()> {
        let body = GroupInfoRecord {
            epoch,
            group_info: group_info.to_vec(),
        };
        let url = self.endpoint(&["groups", &group_id.to_hex(), "group-info"])?;
        check(self.request(Method::PUT, url).json(&body).send().await?).await?;
        Ok(())
    }
}

/// Turn a non-success status into an error carrying the response body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), %url, "relay request failed");
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn upload_key_packages(&self, packages: &[KeyPackageUpload]) -> rampart_core::Result<()> {
        Ok(self.upload(packages).await?)
    }

    async fn fetch_key_packages(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> rampart_core::Result<Vec<PublishedKeyPackage>> {
        Ok(self.fetch(user_id, device_id).await?)
    }

    async fn send_group_message(
        &self,
        group_id: &GroupId,
        epoch: u64,
        message_type: MessageType,
        data: &[u8],
        exclude_user_ids: &[String],
    ) -> rampart_core::Result<()> {
        Ok(self
            .send_message(group_id, epoch, message_type, data, exclude_user_ids)
            .await?)
    }

    async fn send_welcome(
        &self,
        group_id: &GroupId,
        receiver_user_id: &str,
        welcome: &[u8],
        group_info: Option<&[u8]>,
    ) -> rampart_core::Result<()> {
        Ok(self
            .welcome(group_id, receiver_user_id, welcome, group_info)
            .await?)
    }

    async fn get_pending_messages(&self) -> rampart_core::Result<Vec<Envelope>> {
        Ok(self.pending().await?)
    }

    async fn ack_messages(&self, ids: &[MessageId]) -> rampart_core::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        Ok(self.ack(ids).await?)
    }

    async fn get_group_info(&self, group_id: &GroupId) -> rampart_core::Result<Option<Vec<u8>>> {
        Ok(self.fetch_group_info(group_id).await?)
    }

    async fn put_group_info(
        &self,
        group_id: &GroupId,
        epoch: u64,
        group_info: &[u8],
    ) -> rampart_core::Result<()> {
        Ok(self.publish_group_info(group_id, epoch, group_info).await?)
    }
}
