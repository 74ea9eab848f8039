//! Priority-ordered extension execution.
//!
//! [`plan`] gathers the records of one category across several namespaces
//! (the site config plus every enabled plugin) and orders them by descending
//! `priority`. The sort is stable: equal priorities keep discovery order,
//! namespace by namespace, so the same configuration always yields the same
//! plan.
//!
//! The plan is a snapshot. Records enabled or added while the plan executes
//! do not join it.
//!
//! [`Runner`] drives a plan through the lifecycle
//!
//! ```text
//! Configured ──init──▶ Initialized ──run──▶ Run
//!                                   └─────▶ Skipped   (no run hook)
//! ```
//!
//! Every `init` happens before any `run`, so a high-priority extension can
//! rely on lower-priority ones having prepared shared state.

use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};

use crate::extension::{Category, ExtensionError, Implementation};
use crate::site::Context;
use crate::store::{Store, Value};

/// Priority assumed when a record does not set one.
pub const DEFAULT_PRIORITY: f64 = 50.0;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("cannot find requested {category} '{name}'")]
    MissingImplementation { category: Category, name: String },
    #[error("{category} '{name}': priority must be a number, found {found}")]
    InvalidPriority {
        category: Category,
        name: String,
        found: &'static str,
    },
    #[error("{category} '{name}' was not initialized before running")]
    NotInitialized { category: Category, name: String },
    #[error("{category} '{name}' failed to initialize: {source}")]
    Init {
        category: Category,
        name: String,
        #[source]
        source: ExtensionError,
    },
    #[error("{category} '{name}' failed: {source}")]
    Run {
        category: Category,
        name: String,
        #[source]
        source: ExtensionError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Discovered,
    Configured,
    Initialized,
    Run,
    Skipped,
}

/// One entry of an execution plan.
#[derive(Debug, Clone)]
pub struct Planned {
    pub name: String,
    pub priority: f64,
    pub enabled: bool,
    pub record: Store,
    pub implementation: Option<Rc<Implementation>>,
}

/// Collect and order the `category` records found under each namespace.
///
/// Aliases point at the same record and are counted once. With
/// `only_enabled`, records whose `enabled` is not exactly `true` are left
/// out.
pub fn plan(namespaces: &[Store], category: Category, only_enabled: bool) -> Result<Vec<Planned>, RunError> {
    let mut planned = Vec::new();
    for namespace in namespaces {
        let Some(Value::Store(collection)) = namespace.get(category.namespace()) else {
            continue;
        };
        let mut seen: Vec<Store> = Vec::new();
        for (name, value) in collection.entries() {
            let Value::Store(record) = value else {
                continue;
            };
            if seen.iter().any(|s| s.ptr_eq(&record)) {
                continue;
            }
            seen.push(record.clone());

            let enabled = record.get("enabled").and_then(|v| v.as_bool()) == Some(true);
            if only_enabled && !enabled {
                continue;
            }
            let priority = match record.get("priority") {
                None => DEFAULT_PRIORITY,
                Some(value) => value.as_f64().ok_or_else(|| RunError::InvalidPriority {
                    category,
                    name: name.clone(),
                    found: value.type_name(),
                })?,
            };
            let implementation = match record.get("mod") {
                Some(Value::Extension(implementation)) => Some(implementation),
                _ => None,
            };
            planned.push(Planned {
                name,
                priority,
                enabled,
                record,
                implementation,
            });
        }
    }
    planned.sort_by(|a, b| b.priority.total_cmp(&a.priority));
    Ok(planned)
}

/// Executes the enabled extensions of one category.
#[derive(Debug)]
pub struct Runner {
    category: Category,
    plan: Vec<Planned>,
    states: Vec<ExtensionState>,
}

impl Runner {
    /// Freeze the plan of enabled `category` extensions across `namespaces`.
    ///
    /// Fails when an enabled record has no implementation: the user turned
    /// on something that was never loaded.
    pub fn new(namespaces: &[Store], category: Category) -> Result<Self, RunError> {
        let plan = plan(namespaces, category, true)?;
        if let Some(missing) = plan.iter().find(|p| p.implementation.is_none()) {
            return Err(RunError::MissingImplementation {
                category,
                name: missing.name.clone(),
            });
        }
        let states = vec![ExtensionState::Configured; plan.len()];
        Ok(Self {
            category,
            plan,
            states,
        })
    }

    pub fn plan(&self) -> &[Planned] {
        &self.plan
    }

    pub fn states(&self) -> &[ExtensionState] {
        &self.states
    }

    pub fn state_of(&self, name: &str) -> Option<ExtensionState> {
        self.plan
            .iter()
            .position(|p| p.name == name)
            .map(|i| self.states[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.plan.iter().map(|p| p.name.as_str()).collect()
    }

    /// Initialize every planned extension, in plan order.
    pub fn init_all(&mut self, ctx: &Context) -> Result<(), RunError> {
        for (entry, state) in self.plan.iter().zip(self.states.iter_mut()) {
            let Some(implementation) = &entry.implementation else {
                continue;
            };
            let performed = implementation
                .initialize(ctx, &entry.record)
                .map_err(|source| RunError::Init {
                    category: self.category,
                    name: entry.name.clone(),
                    source,
                })?;
            if performed {
                debug!(category = %self.category, extension = %entry.name, "initialized");
            }
            *state = ExtensionState::Initialized;
        }
        Ok(())
    }

    /// Run every planned extension, in plan order, stopping at the first
    /// failure. Later extensions are left in `Initialized`.
    pub fn run_all(&mut self, ctx: &Context) -> Result<(), RunError> {
        for (entry, state) in self.plan.iter().zip(self.states.iter_mut()) {
            let Some(implementation) = &entry.implementation else {
                continue;
            };
            if *state != ExtensionState::Initialized {
                return Err(RunError::NotInitialized {
                    category: self.category,
                    name: entry.name.clone(),
                });
            }
            let ran = implementation
                .run(ctx, &entry.record)
                .map_err(|source| RunError::Run {
                    category: self.category,
                    name: entry.name.clone(),
                    source,
                })?;
            if ran {
                info!(
                    "Running {} {} (priority {})",
                    self.category, entry.name, entry.priority
                );
                *state = ExtensionState::Run;
            } else {
                debug!(category = %self.category, extension = %entry.name, "no run hook");
                *state = ExtensionState::Skipped;
            }
        }
        Ok(())
    }

    /// `init_all` followed by `run_all`.
    pub fn execute(&mut self, ctx: &Context) -> Result<(), RunError> {
        self.init_all(ctx)?;
        self.run_all(ctx)
    }
}
