// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Registry (exchange) HTTP client.
//
// Transport failures are retried forever on a fixed backoff; the registry
// being down must never translate into agreement state loss. Application
// errors (non-2xx) surface to the caller, which decides whether they are
// fatal or just logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::agreement::AgreementId;
use crate::domain::config::DeviceIdentity;
use crate::domain::deployment::ServiceDefinition;
use crate::domain::events::InboundMessage;
use crate::domain::workload::DeviceStatusReport;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("could not decode registry response: {0}")]
    Decode(String),
}

/// One microservice line in an agreement state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsBinding {
    pub org: String,
    pub url: String,
}

/// The workload line, present for pattern-managed nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadBinding {
    pub org: String,
    pub pattern: String,
    pub url: String,
}

/// Body of `PUT orgs/{org}/nodes/{id}/agreements/{aid}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementStateRecord {
    pub microservices: Vec<MsBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadBinding>,
    pub state: String,
}

/// The registry surface the governance core consumes.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn put_agreement_state(
        &self,
        identity: &DeviceIdentity,
        agreement_id: &AgreementId,
        record: &AgreementStateRecord,
    ) -> Result<(), RegistryError>;

    async fn delete_agreement(
        &self,
        identity: &DeviceIdentity,
        agreement_id: &AgreementId,
    ) -> Result<(), RegistryError>;

    async fn list_messages(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<InboundMessage>, RegistryError>;

    async fn delete_message(
        &self,
        identity: &DeviceIdentity,
        msg_id: u64,
    ) -> Result<(), RegistryError>;

    /// Service metadata, used to fill launch environments with declared
    /// defaults. `None` when the service is unknown.
    async fn fetch_service(
        &self,
        identity: &DeviceIdentity,
        org: &str,
        url: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<ServiceDefinition>, RegistryError>;

    async fn put_node_status(
        &self,
        identity: &DeviceIdentity,
        report: &DeviceStatusReport,
    ) -> Result<(), RegistryError>;
}

pub struct HttpRegistryClient {
    base_url: String,
    client: reqwest::Client,
    retry_delay: Duration,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>, retry_delay: Duration) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
            retry_delay,
        }
    }

    fn node_url(&self, identity: &DeviceIdentity, suffix: &str) -> String {
        format!(
            "{}orgs/{}/nodes/{}{}",
            self.base_url, identity.org, identity.device_id, suffix
        )
    }

    /// Send a request, retrying transport failures until the registry
    /// answers. Returns the first actual HTTP response.
    async fn send(
        &self,
        identity: &DeviceIdentity,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> reqwest::Response {
        loop {
            let request = build(&self.client)
                .basic_auth(identity.qualified_id(), Some(&identity.token));
            match request.send().await {
                Ok(response) => return response,
                Err(e) => {
                    warn!("transport error talking to the registry, retrying: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        status: status.as_u16(),
        message,
    })
}

#[derive(Deserialize)]
struct WireMessage {
    id: u64,
    agbot_id: String,
    #[serde(default)]
    agbot_pub_key: String,
    protocol_message: String,
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn put_agreement_state(
        &self,
        identity: &DeviceIdentity,
        agreement_id: &AgreementId,
        record: &AgreementStateRecord,
    ) -> Result<(), RegistryError> {
        let url = self.node_url(identity, &format!("/agreements/{}", agreement_id));
        debug!("setting agreement {} state to {}", agreement_id, record.state);
        let response = self.send(identity, |c| c.put(&url).json(record)).await;
        expect_ok(response).await.map(|_| ())
    }

    async fn delete_agreement(
        &self,
        identity: &DeviceIdentity,
        agreement_id: &AgreementId,
    ) -> Result<(), RegistryError> {
        let url = self.node_url(identity, &format!("/agreements/{}", agreement_id));
        let response = self.send(identity, |c| c.delete(&url)).await;
        expect_ok(response).await.map(|_| ())
    }

    async fn list_messages(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<InboundMessage>, RegistryError> {
        let url = self.node_url(identity, "/msgs");
        let response = self.send(identity, |c| c.get(&url)).await;
        let body = expect_ok(response)
            .await?
            .json::<MessageList>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(body
            .messages
            .into_iter()
            .map(|m| InboundMessage {
                msg_id: m.id,
                broker_id: m.agbot_id,
                broker_pub_key: m.agbot_pub_key,
                protocol_message: m.protocol_message,
            })
            .collect())
    }

    async fn delete_message(
        &self,
        identity: &DeviceIdentity,
        msg_id: u64,
    ) -> Result<(), RegistryError> {
        let url = self.node_url(identity, &format!("/msgs/{}", msg_id));
        let response = self.send(identity, |c| c.delete(&url)).await;
        expect_ok(response).await.map(|_| ())
    }

    async fn fetch_service(
        &self,
        identity: &DeviceIdentity,
        org: &str,
        url: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<ServiceDefinition>, RegistryError> {
        let request_url = format!(
            "{}orgs/{}/services?url={}&version={}&arch={}",
            self.base_url, org, url, version, arch
        );
        let response = self.send(identity, |c| c.get(&request_url)).await;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let body = expect_ok(response)
            .await?
            .json::<ServiceDefinition>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(Some(body))
    }

    async fn put_node_status(
        &self,
        identity: &DeviceIdentity,
        report: &DeviceStatusReport,
    ) -> Result<(), RegistryError> {
        let url = self.node_url(identity, "/status");
        let response = self.send(identity, |c| c.put(&url).json(report)).await;
        expect_ok(response).await.map(|_| ())
    }
}
