// Service Registry
//
// INTENTION: Keep the server's table of registered aliases and keep the
// registry backend informed about them. Registration computes the
// permitted-action set once, stores it next to the service object and
// publishes this server's presence; a background task re-publishes every
// alias for as long as the process lives.
//
// Failures that have no caller (republish, deregistration cleanup, actions
// that do not resolve) go to the event bus.

use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_info};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{PermittedActions, ServiceObject, ServiceRegistration};
use crate::errors::{ErrorKind, RpcError};
use crate::events::EventBus;
use crate::identity::NodeIdentity;
use crate::network::discovery::{validate_alias, ProviderRecord, RegistryAdapter};

/// One row of the registration table
#[derive(Clone)]
pub struct RegisteredService {
    pub alias: String,
    pub service: Arc<dyn ServiceObject>,
    pub permitted_actions: PermittedActions,
    /// Seconds since UNIX epoch
    pub registered_at_epoch: i64,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("alias", &self.alias)
            .field("service", &self.service.name())
            .field("permitted_actions", &self.permitted_actions)
            .field("registered_at_epoch", &self.registered_at_epoch)
            .finish()
    }
}

pub struct ServiceRegistry {
    identity: NodeIdentity,
    adapter: Arc<dyn RegistryAdapter>,
    liveness: Duration,
    services: DashMap<String, RegisteredService>,
    republish_task: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
    logger: Arc<Logger>,
}

impl ServiceRegistry {
    pub fn new(
        identity: NodeIdentity,
        adapter: Arc<dyn RegistryAdapter>,
        liveness: Duration,
        events: EventBus,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            identity,
            adapter,
            liveness,
            services: DashMap::new(),
            republish_task: Mutex::new(None),
            events,
            logger,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Empty list: every action is allowed. Otherwise only listed actions the
    /// object actually exposes; the rest are reported and left out.
    fn permitted_actions(&self, registration: &ServiceRegistration) -> PermittedActions {
        if registration.actions.is_empty() {
            return PermittedActions::AllowAll;
        }

        let mut permitted = BTreeSet::new();
        for action in &registration.actions {
            if registration.service.action(action).is_some() {
                permitted.insert(action.clone());
            } else {
                self.events.error(
                    ErrorKind::InvalidParams,
                    format!(
                        "action '{action}' is not exposed by service '{}'; excluded from alias '{}'",
                        registration.service.name(),
                        registration.alias
                    ),
                );
            }
        }
        PermittedActions::Only(permitted)
    }

    fn record_for(&self, entry: &RegisteredService) -> ProviderRecord {
        ProviderRecord {
            provider_id: self.identity.provider_id.clone(),
            host: self.identity.host.clone(),
            port: self.identity.port,
            permitted_actions: entry.permitted_actions.clone(),
            registered_at_epoch: entry.registered_at_epoch,
        }
    }

    async fn publish_entry(&self, entry: &RegisteredService) -> Result<(), RpcError> {
        let value = self.record_for(entry).to_bytes()?;
        self.adapter
            .publish(
                &entry.alias,
                &self.identity.provider_id,
                value,
                self.liveness,
            )
            .await
    }

    /// Register (or re-register) a service object under its alias.
    ///
    /// The table entry is stored before publishing, so a failed publish is
    /// retried by the republish task; the failure is still returned.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<PermittedActions, RpcError> {
        validate_alias(&registration.alias)?;

        let permitted_actions = self.permitted_actions(&registration);
        let entry = RegisteredService {
            alias: registration.alias.clone(),
            service: registration.service.clone(),
            permitted_actions: permitted_actions.clone(),
            registered_at_epoch: chrono::Utc::now().timestamp(),
        };
        let replaced = self
            .services
            .insert(entry.alias.clone(), entry.clone())
            .is_some();

        if let Err(e) = self.publish_entry(&entry).await {
            self.events
                .report(&format!("publishing alias {}", entry.alias), &e);
            return Err(e);
        }

        self.events.info(format!(
            "{} alias {} as {} with actions {permitted_actions}",
            if replaced { "re-registered" } else { "registered" },
            entry.alias,
            self.identity.provider_id
        ));
        Ok(permitted_actions)
    }

    /// Drop an alias from the table and withdraw its presence. Returns
    /// whether the alias was registered.
    pub async fn deregister(&self, alias: &str) -> bool {
        let Some((_, entry)) = self.services.remove(alias) else {
            self.events.error(
                ErrorKind::NoServiceFound,
                format!("cannot deregister unknown alias {alias}"),
            );
            return false;
        };

        match self
            .adapter
            .remove(&entry.alias, &self.identity.provider_id)
            .await
        {
            Ok(()) => self.events.info(format!("deregistered alias {alias}")),
            Err(e) => self
                .events
                .report(&format!("withdrawing presence of alias {alias}"), &e),
        }
        true
    }

    pub fn resolve(&self, alias: &str) -> Option<RegisteredService> {
        self.services.get(alias).map(|entry| entry.value().clone())
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Re-affirm every alias once
    pub async fn republish_all(&self) {
        let entries: Vec<RegisteredService> =
            self.services.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            match self.publish_entry(&entry).await {
                Ok(()) => log_debug!(self.logger, "re-published alias {}", entry.alias),
                Err(e) => self
                    .events
                    .report(&format!("presence republish of {}", entry.alias), &e),
            }
        }
    }

    /// Start the periodic republish loop (once)
    pub fn start_republish(self: &Arc<Self>, interval: Duration) {
        let mut task = self.republish_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        log_info!(
            self.logger,
            "re-publishing presence every {}s",
            interval.as_secs()
        );
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; registration already published
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(registry) => registry.republish_all().await,
                    None => break,
                }
            }
        }));
    }

    /// Stop republishing and withdraw every alias
    pub async fn shutdown(&self) {
        let task = self.republish_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
        for alias in self.aliases() {
            self.deregister(&alias).await;
        }
    }
}
