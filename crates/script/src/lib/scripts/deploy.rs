use std::sync::Arc;

use thiserror::Error;

use crate::artifacts::ArtifactStore;
use crate::consts::NetworkInfo;
use crate::deployer::ProxyDeployer;
use crate::engine::{ComponentOutcome, ExecutionEngine, RunReport};
use crate::eth_client::ExecutionBackend;
use crate::linker::Linker;
use crate::plan::{self, ComponentId};
use crate::registry::{self, AddressRegistry, RunLock};
use crate::scripts::prelude::{ConfigError, DeploySettings, ScriptRuntime};

#[derive(Debug)]
pub struct Flags {
    /// Validate the configuration and print the plan without touching the
    /// network or the ledger.
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] plan::Error),

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error("Deployment incomplete: {}", describe_failures(failed))]
    Incomplete { failed: Vec<(ComponentId, String)> },
}

fn describe_failures(failed: &[(ComponentId, String)]) -> String {
    failed
        .iter()
        .map(|(component, error)| format!("{component}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn run(runtime: &ScriptRuntime, flags: &Flags) -> Result<RunReport, Error> {
    let network_name = runtime.network().as_str();
    run_with_backend(runtime.backend.clone(), &runtime.settings, &network_name, flags).await
}

pub async fn run_with_backend<B: ExecutionBackend>(
    backend: Arc<B>,
    settings: &DeploySettings,
    network_name: &str,
    flags: &Flags,
) -> Result<RunReport, Error> {
    // Configuration problems abort here, before anything is submitted or
    // persisted.
    settings.validate()?;

    let components = plan::easyswap_components(
        settings.protocol_share_bps,
        &settings.eip712_name,
        &settings.eip712_version,
    );
    let execution_plan = plan::build_plan(components)?;

    tracing::info!(
        network = %network_name,
        "Execution plan: {}",
        execution_plan
            .components()
            .iter()
            .map(|spec| spec.id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    if flags.dry_run {
        tracing::info!("Dry run complete: configuration and plan are valid, nothing was submitted");
        return Ok(RunReport::default());
    }

    // Held until the run finishes; concurrent runs against this network fail
    // fast instead of racing on the ledger.
    let _lock = RunLock::acquire(&settings.deployments_dir, network_name)?;
    let registry = AddressRegistry::open(&settings.deployments_dir, network_name)?;

    let deployer = ProxyDeployer::new(
        backend.clone(),
        ArtifactStore::new(&settings.artifacts_dir),
        settings.confirmation_timeout,
    );
    let linker = Linker::new(backend.clone(), settings.confirmation_timeout);
    let engine = ExecutionEngine::new(
        execution_plan,
        network_name.to_owned(),
        registry,
        deployer,
        linker,
        backend,
    );

    let report = engine.run().await?;

    for (component, outcome) in &report.outcomes {
        match outcome {
            ComponentOutcome::AlreadyVerified => {
                tracing::info!(component = %component, "Already verified")
            }
            ComponentOutcome::Verified => tracing::info!(component = %component, "Verified"),
            ComponentOutcome::Pending { reason } => {
                tracing::warn!(component = %component, "Pending: {reason}")
            }
            ComponentOutcome::Failed { error } => {
                tracing::error!(component = %component, "Failed: {error}")
            }
            ComponentOutcome::Blocked { on } => {
                tracing::warn!(component = %component, "Blocked on {on}")
            }
        }
    }

    if report.all_verified() {
        Ok(report)
    } else {
        Err(Error::Incomplete {
            failed: report.failures(),
        })
    }
}
