//! Shared application state.

use reconciliation::services::{InMemoryBillingService, InMemoryCrmService, InMemorySignatureService};
use reconciliation::{
    MagicLinkIssuer, OrchestratorConfig, ProvisioningOrchestrator, Reconciler, SessionService,
};
use session_store::Store;

use crate::config::Config;
use crate::signature::WebhookVerifier;

/// Provider collaborators the services call out to.
#[derive(Debug, Clone, Default)]
pub struct Collaborators {
    pub crm: InMemoryCrmService,
    pub signature: InMemorySignatureService,
    pub billing: InMemoryBillingService,
}

pub type AppSessionService<S> =
    SessionService<S, InMemoryCrmService, InMemorySignatureService, InMemoryBillingService>;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub store: S,
    pub collaborators: Collaborators,
    pub reconciler: Reconciler<S, InMemoryCrmService>,
    pub sessions: AppSessionService<S>,
    pub magic_links: MagicLinkIssuer<S, InMemoryCrmService>,
    pub verifier: WebhookVerifier,
}

impl<S: Store + Clone> AppState<S> {
    pub fn new(store: S, collaborators: Collaborators, config: &Config) -> Self {
        let orchestrator = ProvisioningOrchestrator::new(
            store.clone(),
            collaborators.crm.clone(),
            OrchestratorConfig {
                provider_timeout: config.provider_timeout,
                lease_duration: config.provisioning_lease,
            },
        );

        Self {
            reconciler: Reconciler::new(store.clone(), orchestrator.clone()),
            sessions: SessionService::new(
                store.clone(),
                orchestrator,
                collaborators.signature.clone(),
                collaborators.billing.clone(),
                config.provider_timeout,
            ),
            magic_links: MagicLinkIssuer::new(
                store.clone(),
                collaborators.crm.clone(),
                config.public_base_url.clone(),
                config.provider_timeout,
            ),
            verifier: WebhookVerifier::new(config.webhook_secrets.clone()),
            store,
            collaborators,
        }
    }
}
