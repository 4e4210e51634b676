use std::collections::{BTreeMap, HashSet};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ComponentId = String;

/// One initializer argument: either a literal value, or a placeholder that the
/// engine substitutes with a dependency's proxy address once that dependency
/// is deployed. A `DependencyProxy` surviving until encoding is an ordering
/// bug, not a user error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitArg {
    Uint { value: u128, bits: usize },
    Address(Address),
    Str(String),
    DependencyProxy(ComponentId),
}

/// Post-deployment cross-wiring call, declared on the component whose contract
/// receives it. `target` names the component whose proxy address gets written;
/// `get_method` is the view used for the pre-check and the read-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub target: ComponentId,
    pub set_method: String,
    pub get_method: String,
}

impl LinkSpec {
    /// Registry key for this link, scoped to its source component.
    pub fn link_id(&self, source: &str) -> String {
        format!("{}:{}->{}", source, self.set_method, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub id: ComponentId,
    pub name: String,
    pub depends_on: Vec<ComponentId>,
    /// Compiled-contract artifact holding the implementation creation code.
    pub artifact: String,
    /// Canonical initializer signature, e.g. `initialize(uint128,address,string,string)`.
    pub init_signature: String,
    pub init_args: Vec<InitArg>,
    pub links: Vec<LinkSpec>,
}

/// Components in dependency order: every dependency precedes its dependents.
/// Built once per run via [`build_plan`]; immutable afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    components: Vec<ComponentSpec>,
}

impl ExecutionPlan {
    pub fn components(&self) -> &[ComponentSpec] {
        &self.components
    }

    pub fn get(&self, id: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|spec| spec.id == id)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Component {component} declared more than once")]
    DuplicateComponent { component: ComponentId },

    #[error("Component {component} depends on unknown component {dependency}")]
    UnknownDependency {
        component: ComponentId,
        dependency: ComponentId,
    },

    #[error("Dependency cycle between components: {}", participants.join(", "))]
    CyclicDependency { participants: Vec<ComponentId> },
}

/// Kahn's algorithm over the declared dependencies. Deterministic: among the
/// components ready at any step, the one declared first wins, so re-runs see
/// an identical order.
pub fn build_plan(specs: Vec<ComponentSpec>) -> Result<ExecutionPlan, Error> {
    let mut index_of: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, spec) in specs.iter().enumerate() {
        if index_of.insert(&spec.id, idx).is_some() {
            return Err(Error::DuplicateComponent {
                component: spec.id.clone(),
            });
        }
    }

    let mut in_degree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (idx, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            let dep_idx = *index_of
                .get(dep.as_str())
                .ok_or_else(|| Error::UnknownDependency {
                    component: spec.id.clone(),
                    dependency: dep.clone(),
                })?;
            in_degree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut emitted: HashSet<usize> = HashSet::new();
    let mut order: Vec<usize> = Vec::with_capacity(specs.len());
    while order.len() < specs.len() {
        // Declaration-order tie break keeps the plan stable across runs.
        let next = (0..specs.len()).find(|idx| !emitted.contains(idx) && in_degree[*idx] == 0);
        match next {
            Some(idx) => {
                emitted.insert(idx);
                order.push(idx);
                for dependent in &dependents[idx] {
                    in_degree[*dependent] -= 1;
                }
            }
            None => {
                let participants = specs
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !emitted.contains(idx))
                    .map(|(_, spec)| spec.id.clone())
                    .collect();
                return Err(Error::CyclicDependency { participants });
            }
        }
    }

    let mut by_index: BTreeMap<usize, ComponentSpec> = specs.into_iter().enumerate().collect();
    let components = order
        .into_iter()
        .map(|idx| by_index.remove(&idx).expect("index emitted exactly once"))
        .collect();
    Ok(ExecutionPlan { components })
}

pub const VAULT: &str = "vault";
pub const ORDER_BOOK: &str = "order-book";

/// The EasySwap deployment: the vault must exist before the order book (the
/// order book initializer takes the vault's proxy address), and afterwards the
/// vault is pointed back at the order book via `setOrderBook`.
pub fn easyswap_components(
    protocol_share_bps: u16,
    eip712_name: &str,
    eip712_version: &str,
) -> Vec<ComponentSpec> {
    vec![
        ComponentSpec {
            id: VAULT.to_owned(),
            name: "EasySwapVault".to_owned(),
            depends_on: vec![],
            artifact: "EasySwapVault".to_owned(),
            init_signature: "initialize()".to_owned(),
            init_args: vec![],
            links: vec![LinkSpec {
                target: ORDER_BOOK.to_owned(),
                set_method: "setOrderBook(address)".to_owned(),
                get_method: "orderBook()".to_owned(),
            }],
        },
        ComponentSpec {
            id: ORDER_BOOK.to_owned(),
            name: "EasySwapOrderBook".to_owned(),
            depends_on: vec![VAULT.to_owned()],
            artifact: "EasySwapOrderBook".to_owned(),
            init_signature: "initialize(uint128,address,string,string)".to_owned(),
            init_args: vec![
                InitArg::Uint {
                    value: protocol_share_bps as u128,
                    bits: 128,
                },
                InitArg::DependencyProxy(VAULT.to_owned()),
                InitArg::Str(eip712_name.to_owned()),
                InitArg::Str(eip712_version.to_owned()),
            ],
            links: vec![],
        },
    ]
}
