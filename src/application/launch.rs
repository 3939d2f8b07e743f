// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Acceptance and finalization.
//
// When a reply-ack (or ledger evidence standing in for a lost one)
// confirms an agreement, the node records acceptance, tells the registry,
// assembles the launch context for the container collaborator, pins and
// starts the dependent microservices, and, once evidence is in, marks
// the agreement finalized.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::agreement::Agreement;
use crate::domain::config::{AgentConfig, DeviceIdentity};
use crate::domain::events::{CollaboratorEvent, LaunchContext, ServicePin};
use crate::domain::protocol::{Proposal, ProtocolHandler};
use crate::domain::repository::{AgreementStore, LifecycleTransition};
use crate::domain::version::VersionRange;
use crate::domain::workload::{select_workload_config, MicroserviceCoordinator, WorkloadConfigStore};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::registry::{
    AgreementStateRecord, MsBinding, RegistryClient, WorkloadBinding,
};

pub const STATE_ACCEPTED: &str = "Agree to proposal";
pub const STATE_FINALIZED: &str = "Finalized Agreement";

pub struct LaunchService {
    config: Arc<AgentConfig>,
    store: Arc<dyn AgreementStore>,
    workload_configs: Arc<dyn WorkloadConfigStore>,
    microservices: Arc<dyn MicroserviceCoordinator>,
    exchange: Arc<dyn RegistryClient>,
    bus: EventBus,
    identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
}

impl LaunchService {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn AgreementStore>,
        workload_configs: Arc<dyn WorkloadConfigStore>,
        microservices: Arc<dyn MicroserviceCoordinator>,
        exchange: Arc<dyn RegistryClient>,
        bus: EventBus,
        identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
    ) -> Self {
        Self {
            config,
            store,
            workload_configs,
            microservices,
            exchange,
            bus,
            identity,
        }
    }

    /// Record a positive reply-ack: accept locally, tell the registry, and
    /// hand the container collaborator everything it needs to launch.
    pub async fn record_reply(&self, proposal: &Proposal, protocol: &str) -> Result<Agreement> {
        let agreement = self
            .store
            .record(protocol, &proposal.agreement_id, LifecycleTransition::Accepted)
            .await
            .context("recording acceptance")?;

        let identity = self.identity.read().await.clone();
        self.exchange
            .put_agreement_state(
                &identity,
                &proposal.agreement_id,
                &self.state_record(proposal, &identity, STATE_ACCEPTED),
            )
            .await
            .context("recording accepted state in the registry")?;

        let environment = self.launch_environment(proposal, &identity).await?;
        let services = self.start_dependent_services(proposal, protocol).await?;

        self.bus.publish(CollaboratorEvent::AgreementReached {
            launch: LaunchContext {
                protocol: protocol.to_string(),
                agreement_id: proposal.agreement_id.clone(),
                deployment: proposal.workload.deployment.clone(),
                environment,
                services,
            },
        });

        // Ask for a ledger client if this agreement is witnessed on one.
        if !agreement.ledger.is_empty() {
            self.bus.publish(CollaboratorEvent::NewLedgerClient {
                ledger: agreement.ledger.clone(),
            });
        }

        info!("accepted agreement {}", proposal.agreement_id);
        Ok(agreement)
    }

    /// Finalize an agreement for which ledger (or broker) evidence exists.
    /// A lost reply-ack is repaired on the way: evidence of creation means
    /// we should have accepted.
    pub async fn finalize(
        &self,
        agreement: &Agreement,
        handler: &Arc<dyn ProtocolHandler>,
    ) -> Result<()> {
        let proposal = handler
            .demarshal_proposal(&agreement.proposal)
            .map_err(|e| anyhow!("could not demarshal proposal for {}: {}", agreement.id, e))?;

        if agreement.accepted_time == 0 {
            self.record_reply(&proposal, &agreement.protocol).await?;
        }

        self.store
            .record(
                &agreement.protocol,
                &agreement.id,
                LifecycleTransition::Finalized,
            )
            .await
            .context("recording finalization")?;
        debug!("agreement {} finalized", agreement.id);

        let identity = self.identity.read().await.clone();
        self.exchange
            .put_agreement_state(
                &identity,
                &agreement.id,
                &self.state_record(&proposal, &identity, STATE_FINALIZED),
            )
            .await
            .context("recording finalized state in the registry")?;
        Ok(())
    }

    fn state_record(
        &self,
        proposal: &Proposal,
        identity: &DeviceIdentity,
        state: &str,
    ) -> AgreementStateRecord {
        let workload = if identity.pattern.is_empty() {
            None
        } else {
            Some(WorkloadBinding {
                org: identity.org.clone(),
                pattern: identity.pattern.clone(),
                url: proposal.workload.url.clone(),
            })
        };
        AgreementStateRecord {
            microservices: proposal
                .services
                .iter()
                .map(|s| MsBinding {
                    org: s.org.clone(),
                    url: s.url.clone(),
                })
                .collect(),
            workload,
            state: state.to_string(),
        }
    }

    /// The environment a workload launches with: operator-configured
    /// variables for the running version, catalog defaults for unset
    /// declared inputs, and the identity variables every workload gets.
    async fn launch_environment(
        &self,
        proposal: &Proposal,
        identity: &DeviceIdentity,
    ) -> Result<HashMap<String, String>> {
        let workload = &proposal.workload;

        let configs = self
            .workload_configs
            .find_for_url(&workload.url)
            .await
            .context("loading workload configs")?;
        let mut env: HashMap<String, String> =
            match select_workload_config(configs, &workload.version) {
                Some(config) => config.variables.into_iter().collect(),
                None => HashMap::new(),
            };

        // The config on hand may predate the version we are about to run;
        // fill unset declared inputs from the catalog defaults.
        if let Some(definition) = self
            .exchange
            .fetch_service(
                identity,
                &workload.org,
                &workload.url,
                &workload.version,
                &workload.arch,
            )
            .await
            .context("fetching workload metadata")?
        {
            for input in &definition.user_inputs {
                if !input.default_value.is_empty() && !env.contains_key(&input.name) {
                    env.insert(input.name.clone(), input.default_value.clone());
                }
            }
        }

        let prefix = &self.config.env_prefix;
        env.insert(
            format!("{}AGREEMENTID", prefix),
            proposal.agreement_id.to_string(),
        );
        env.insert(format!("{}DEVICE_ID", prefix), identity.device_id.clone());
        env.insert(format!("{}ORGANIZATION", prefix), identity.org.clone());
        env.insert(format!("{}HASH", prefix), workload.password.clone());
        env.insert(
            format!("{}EXCHANGE_URL", prefix),
            self.config.registry_url.clone(),
        );
        Ok(env)
    }

    /// Pin each dependent service to one concrete version and start it.
    async fn start_dependent_services(
        &self,
        proposal: &Proposal,
        protocol: &str,
    ) -> Result<Vec<ServicePin>> {
        let mut pins = Vec::new();
        for dep in &proposal.services {
            let range = VersionRange::parse(&dep.version_range).map_err(|e| {
                anyhow!(
                    "bad version range {} for dependent service {}: {}",
                    dep.version_range,
                    dep.url,
                    e
                )
            })?;
            match self
                .microservices
                .resolve_and_start(&dep.org, &dep.url, &range, &proposal.agreement_id, protocol)
                .await
                .with_context(|| format!("starting dependent service {}", dep.url))?
            {
                Some(pin) => pins.push(pin),
                // No local definition: older nodes run dependencies baked
                // into the workload itself.
                None => debug!("no local definition for dependent service {}", dep.url),
            }
        }
        Ok(pins)
    }
}
