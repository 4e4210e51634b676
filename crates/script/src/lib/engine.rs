use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::deployer::{self, ProxyDeployer};
use crate::eth_client::{abi, ExecutionBackend, StateQuery};
use crate::linker::{self, LinkAction, Linker, LinkOutcome};
use crate::plan::{ComponentId, ComponentSpec, ExecutionPlan, InitArg};
use crate::registry::{self, AddressRegistry, DeploymentRecord, LinkRecord, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Dependency {dependency} of {component} has no deployed record; the plan or engine broke ordering")]
    DependencyNotReady {
        component: ComponentId,
        dependency: ComponentId,
    },

    #[error(transparent)]
    Deploy(#[from] deployer::Error),

    #[error(transparent)]
    Link(#[from] linker::Error),

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error("Verification failed for {component}: {detail}")]
    Verification { component: ComponentId, detail: String },

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Terminal outcome of one component for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutcome {
    /// Ledger already said verified; nothing touched the backend.
    AlreadyVerified,
    Verified,
    /// A transaction is submitted but unconfirmed; the next run polls it.
    Pending { reason: String },
    Failed { error: String },
    /// Not attempted because a dependency did not reach a usable state.
    Blocked { on: ComponentId },
}

impl ComponentOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::AlreadyVerified | Self::Verified)
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// Plan order.
    pub outcomes: Vec<(ComponentId, ComponentOutcome)>,
}

impl RunReport {
    pub fn all_verified(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|(_, outcome)| outcome.is_verified())
    }

    pub fn outcome(&self, component: &str) -> Option<&ComponentOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == component)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> Vec<(ComponentId, String)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                ComponentOutcome::Failed { error } => Some((id.clone(), error.clone())),
                ComponentOutcome::Blocked { on } => Some((id.clone(), format!("blocked on {on}"))),
                ComponentOutcome::Pending { reason } => Some((id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Drives one deployment run: walks the plan in dependency order, consults the
/// registry before every side effect, delegates to the deployer and linker,
/// and only declares a component done after the live chain state matches the
/// ledger. Single logical thread; the per-network run lock is held by the
/// caller for the whole run.
pub struct ExecutionEngine<B> {
    plan: ExecutionPlan,
    network: String,
    registry: AddressRegistry,
    deployer: ProxyDeployer<B>,
    linker: Linker<B>,
    backend: Arc<B>,
}

impl<B: ExecutionBackend> ExecutionEngine<B> {
    pub fn new(
        plan: ExecutionPlan,
        network: String,
        registry: AddressRegistry,
        deployer: ProxyDeployer<B>,
        linker: Linker<B>,
        backend: Arc<B>,
    ) -> Self {
        Self {
            plan,
            network,
            registry,
            deployer,
            linker,
            backend,
        }
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub async fn run(mut self) -> Result<RunReport, registry::Error> {
        let specs: Vec<ComponentSpec> = self.plan.components().to_vec();
        let mut outcomes: BTreeMap<ComponentId, ComponentOutcome> = BTreeMap::new();

        for spec in &specs {
            if let Some(on) = Self::blocking_dependency(spec, &outcomes) {
                tracing::warn!(component = %spec.id, "Skipping: dependency {on} did not complete");
                outcomes.insert(spec.id.clone(), ComponentOutcome::Blocked { on });
                continue;
            }

            if self.registry.is_satisfied(&spec.id, Status::Verified) {
                tracing::info!(component = %spec.id, "Already verified, skipping");
                outcomes.insert(spec.id.clone(), ComponentOutcome::AlreadyVerified);
                continue;
            }

            if let Err(err) = self.ensure_deployed(spec).await {
                match Self::triage(err)? {
                    Triage::Pending(reason) => {
                        outcomes.insert(spec.id.clone(), ComponentOutcome::Pending { reason });
                    }
                    Triage::Failed(error) => {
                        tracing::error!(component = %spec.id, "Deployment failed: {error}");
                        self.mark_failed(&spec.id)?;
                        outcomes.insert(spec.id.clone(), ComponentOutcome::Failed { error });
                    }
                }
                continue;
            }

            // Links become ready as their endpoints come up; re-scan after
            // every deployment so a link fires at the first moment both ends
            // exist.
            if let Err((source, err)) = self.run_ready_links(&specs).await {
                match Self::triage(err)? {
                    Triage::Pending(reason) => {
                        outcomes.insert(source, ComponentOutcome::Pending { reason });
                    }
                    Triage::Failed(error) => {
                        tracing::error!(component = %source, "Linking failed: {error}");
                        self.mark_failed(&source)?;
                        outcomes.insert(source, ComponentOutcome::Failed { error });
                    }
                }
            }
        }

        for spec in &specs {
            if outcomes.contains_key(&spec.id) {
                continue;
            }

            if let Some((source, target, link_id)) = self.unsatisfied_link(spec, &specs) {
                // A dead endpoint means the link can never land this run;
                // otherwise a submitted link transaction is still in flight.
                let dead_endpoint = [source, target].into_iter().find(|id| {
                    matches!(
                        outcomes.get(id),
                        Some(ComponentOutcome::Failed { .. }) | Some(ComponentOutcome::Blocked { .. })
                    )
                });
                let outcome = match dead_endpoint {
                    Some(on) => ComponentOutcome::Blocked { on },
                    None => ComponentOutcome::Pending {
                        reason: format!("link {link_id} not confirmed"),
                    },
                };
                outcomes.insert(spec.id.clone(), outcome);
                continue;
            }

            match self.verify_component(spec).await {
                Ok(()) => {
                    outcomes.insert(spec.id.clone(), ComponentOutcome::Verified);
                }
                Err(err) => match Self::triage(err)? {
                    Triage::Pending(reason) => {
                        outcomes.insert(spec.id.clone(), ComponentOutcome::Pending { reason });
                    }
                    Triage::Failed(error) => {
                        tracing::error!(component = %spec.id, "Verification failed: {error}");
                        self.mark_failed(&spec.id)?;
                        outcomes.insert(spec.id.clone(), ComponentOutcome::Failed { error });
                    }
                },
            }
        }

        let report = RunReport {
            outcomes: specs
                .iter()
                .map(|spec| {
                    let outcome = outcomes
                        .remove(&spec.id)
                        .expect("every component receives an outcome");
                    (spec.id.clone(), outcome)
                })
                .collect(),
        };
        Ok(report)
    }

    fn blocking_dependency(
        spec: &ComponentSpec,
        outcomes: &BTreeMap<ComponentId, ComponentOutcome>,
    ) -> Option<ComponentId> {
        spec.depends_on
            .iter()
            .find(|dep| {
                matches!(
                    outcomes.get(dep.as_str()),
                    Some(ComponentOutcome::Failed { .. })
                        | Some(ComponentOutcome::Blocked { .. })
                        | Some(ComponentOutcome::Pending { .. })
                )
            })
            .cloned()
    }

    async fn ensure_deployed(&mut self, spec: &ComponentSpec) -> Result<(), Error> {
        if self.registry.is_satisfied(&spec.id, Status::Deployed) {
            return Ok(());
        }

        let resolved = self.resolve_args(spec)?;
        let mut record = match self.registry.lookup(&spec.id) {
            Some(existing) => {
                let mut resumed = existing.clone();
                resumed.status = Status::Pending;
                resumed.init_args = resolved;
                resumed
            }
            None => DeploymentRecord::new(&spec.id, &self.network, resolved),
        };
        // The attempt is on the ledger before the first transaction goes out.
        self.registry.record(record.clone())?;

        self.deployer.deploy(spec, &mut record, &mut self.registry).await?;
        Ok(())
    }

    /// Substitutes dependency placeholders with proxy addresses from the
    /// ledger. Plan ordering guarantees the dependency is already deployed;
    /// a miss here is a defect, not a user error.
    fn resolve_args(&self, spec: &ComponentSpec) -> Result<Vec<InitArg>, Error> {
        spec.init_args
            .iter()
            .map(|arg| match arg {
                InitArg::DependencyProxy(dependency) => {
                    let proxy = self
                        .registry
                        .lookup(dependency)
                        .filter(|record| record.status >= Status::Deployed)
                        .and_then(|record| record.proxy);
                    match proxy {
                        Some(address) => Ok(InitArg::Address(address)),
                        None => Err(Error::DependencyNotReady {
                            component: spec.id.clone(),
                            dependency: dependency.clone(),
                        }),
                    }
                }
                other => Ok(other.clone()),
            })
            .collect()
    }

    async fn run_ready_links(&mut self, specs: &[ComponentSpec]) -> Result<(), (ComponentId, Error)> {
        for source in specs {
            for link_spec in &source.links {
                let link_id = link_spec.link_id(&source.id);
                if self.registry.is_link_satisfied(&link_id, Status::Linked) {
                    continue;
                }
                let both_deployed = self.registry.is_satisfied(&source.id, Status::Deployed)
                    && self.registry.is_satisfied(&link_spec.target, Status::Deployed);
                if !both_deployed {
                    continue;
                }

                let action = self
                    .link_action(&source.id, link_spec.target.as_str(), &link_id, link_spec)
                    .map_err(|err| (source.id.clone(), err))?;
                let prior_tx = self
                    .registry
                    .lookup_link(&link_id)
                    .filter(|record| record.status == Status::Pending)
                    .and_then(|record| record.tx_hash);

                match self.linker.link(&action, prior_tx).await {
                    Ok(outcome) => {
                        let tx_hash = match outcome {
                            LinkOutcome::Linked { tx_hash } => Some(tx_hash),
                            LinkOutcome::AlreadyLinked => prior_tx,
                        };
                        self.registry
                            .record_link(
                                &link_id,
                                LinkRecord {
                                    link: link_id.clone(),
                                    status: Status::Linked,
                                    desired: action.desired,
                                    tx_hash,
                                    updated_at: 0,
                                },
                            )
                            .map_err(|err| (source.id.clone(), err.into()))?;
                        self.advance_source_status(source)
                            .map_err(|err| (source.id.clone(), err.into()))?;
                    }
                    Err(linker::Error::ConfirmationTimeout { tx_hash, link }) => {
                        self.registry
                            .record_link(
                                &link_id,
                                LinkRecord {
                                    link: link_id.clone(),
                                    status: Status::Pending,
                                    desired: action.desired,
                                    tx_hash: Some(tx_hash),
                                    updated_at: 0,
                                },
                            )
                            .map_err(|err| (source.id.clone(), err.into()))?;
                        return Err((
                            source.id.clone(),
                            Error::Link(linker::Error::ConfirmationTimeout { tx_hash, link }),
                        ));
                    }
                    Err(err) => return Err((source.id.clone(), err.into())),
                }
            }
        }
        Ok(())
    }

    fn link_action(
        &self,
        source: &str,
        target: &str,
        link_id: &str,
        link_spec: &crate::plan::LinkSpec,
    ) -> Result<LinkAction, Error> {
        let source_proxy = self
            .registry
            .lookup(source)
            .and_then(|record| record.proxy)
            .ok_or_else(|| Error::DependencyNotReady {
                component: source.to_owned(),
                dependency: source.to_owned(),
            })?;
        let desired = self
            .registry
            .lookup(target)
            .and_then(|record| record.proxy)
            .ok_or_else(|| Error::DependencyNotReady {
                component: source.to_owned(),
                dependency: target.to_owned(),
            })?;
        Ok(LinkAction {
            id: link_id.to_owned(),
            source: source.to_owned(),
            source_proxy,
            target: target.to_owned(),
            desired,
            set_method: link_spec.set_method.clone(),
            get_method: link_spec.get_method.clone(),
        })
    }

    /// A component advances to `linked` once every link it sources has been
    /// confirmed.
    fn advance_source_status(&mut self, source: &ComponentSpec) -> Result<(), registry::Error> {
        let all_linked = source
            .links
            .iter()
            .all(|link| self.registry.is_link_satisfied(&link.link_id(&source.id), Status::Linked));
        if !all_linked {
            return Ok(());
        }
        if let Some(record) = self.registry.lookup(&source.id) {
            if record.status < Status::Linked {
                let mut updated = record.clone();
                updated.status = Status::Linked;
                self.registry.record(updated)?;
            }
        }
        Ok(())
    }

    /// First link touching this component (as source or target) that is not
    /// yet confirmed, as `(source, target, link_id)`.
    fn unsatisfied_link(
        &self,
        spec: &ComponentSpec,
        specs: &[ComponentSpec],
    ) -> Option<(ComponentId, ComponentId, String)> {
        for source in specs {
            for link in &source.links {
                if source.id != spec.id && link.target != spec.id {
                    continue;
                }
                let link_id = link.link_id(&source.id);
                if !self.registry.is_link_satisfied(&link_id, Status::Linked) {
                    return Some((source.id.clone(), link.target.clone(), link_id));
                }
            }
        }
        None
    }

    /// Declares a component verified only after the chain agrees with the
    /// ledger: the ERC-1967 implementation slot matches the recorded
    /// implementation, and every sourced link reads back its desired value.
    async fn verify_component(&mut self, spec: &ComponentSpec) -> Result<(), Error> {
        let record = self
            .registry
            .lookup(&spec.id)
            .cloned()
            .ok_or_else(|| Error::Verification {
                component: spec.id.clone(),
                detail: "no deployment record".to_owned(),
            })?;
        let proxy = record.proxy.ok_or_else(|| Error::Verification {
            component: spec.id.clone(),
            detail: "record has no proxy address".to_owned(),
        })?;

        let word = self
            .backend
            .read_state(proxy, &StateQuery::implementation_slot())
            .await
            .map_err(|err| Error::Backend(err.to_string()))?;
        let live_implementation = abi::decode_address_word(&word);
        if live_implementation != record.implementation {
            return Err(Error::Verification {
                component: spec.id.clone(),
                detail: format!(
                    "implementation slot holds {live_implementation:?}, ledger has {:?}",
                    record.implementation
                ),
            });
        }

        for link_spec in &spec.links {
            let link_id = link_spec.link_id(&spec.id);
            let action = self.link_action(&spec.id, link_spec.target.as_str(), &link_id, link_spec)?;
            let current = self.linker.read_current(&action).await?;
            if current != action.desired {
                return Err(Error::Verification {
                    component: spec.id.clone(),
                    detail: format!("link {link_id} reads {current}, expected {}", action.desired),
                });
            }
            // Link held up under read-back; verified is the final word on it.
            if let Some(link_record) = self.registry.lookup_link(&link_id) {
                if link_record.status < Status::Verified {
                    let mut updated = link_record.clone();
                    updated.status = Status::Verified;
                    self.registry.record_link(&link_id, updated)?;
                }
            }
        }

        let mut updated = record;
        updated.status = Status::Verified;
        self.registry.record(updated)?;
        tracing::info!(component = %spec.id, "Verified");
        Ok(())
    }

    fn mark_failed(&mut self, component: &str) -> Result<(), registry::Error> {
        if let Some(record) = self.registry.lookup(component) {
            let mut updated = record.clone();
            updated.status = Status::Failed;
            self.registry.record(updated)?;
        }
        Ok(())
    }

    fn triage(err: Error) -> Result<Triage, registry::Error> {
        match err {
            Error::Registry(registry_err) => Err(registry_err),
            Error::Deploy(deployer::Error::Registry(registry_err)) => Err(registry_err),
            Error::Deploy(deployer::Error::ConfirmationTimeout { ref tx_hash, .. }) => {
                Ok(Triage::Pending(format!("transaction {tx_hash} awaiting confirmation")))
            }
            Error::Link(linker::Error::ConfirmationTimeout { ref tx_hash, .. }) => {
                Ok(Triage::Pending(format!("link transaction {tx_hash} awaiting confirmation")))
            }
            other => Ok(Triage::Failed(other.to_string())),
        }
    }
}

enum Triage {
    Pending(String),
    Failed(String),
}
