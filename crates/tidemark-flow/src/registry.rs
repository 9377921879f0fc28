//! Table registry.
//!
//! The registry is the validated, immutable view of the pipeline
//! configuration: which tables are sources, which are derived, what each
//! derived table reads from, and the order refreshes must follow. A registry
//! is built once and never mutated; [`RegistryHandle::swap`] replaces it
//! wholesale on reload.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::transform::{Transform, TransformCatalog, TransformSpec};

/// Definition of one derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTableSpec {
    /// Table name, unique across sources and derived tables.
    pub name: String,
    /// Tables this one reads from: sources or other derived tables.
    pub upstreams: Vec<String>,
    /// Maximum tolerated staleness (e.g. `"5m"`).
    #[serde(with = "humantime_serde")]
    pub target_lag: Duration,
    /// Row transform applied to upstream rows.
    #[serde(default)]
    pub transform: TransformSpec,
}

impl DerivedTableSpec {
    /// Creates an identity-transform spec.
    #[must_use]
    pub fn new(name: impl Into<String>, upstreams: &[&str], target_lag: Duration) -> Self {
        Self {
            name: name.into(),
            upstreams: upstreams.iter().map(ToString::to_string).collect(),
            target_lag,
            transform: TransformSpec::Identity,
        }
    }

    /// Replaces the transform.
    #[must_use]
    pub fn with_transform(mut self, transform: TransformSpec) -> Self {
        self.transform = transform;
        self
    }
}

/// Validated table graph.
#[derive(Debug)]
pub struct TableRegistry {
    sources: BTreeSet<String>,
    specs: HashMap<String, DerivedTableSpec>,
    transforms: HashMap<String, Arc<dyn Transform>>,
    refresh_order: Vec<String>,
    dag: Dag<String>,
}

impl TableRegistry {
    /// Validates a configuration and builds the registry.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for empty or duplicate names, a derived
    ///   table without upstreams, a zero target lag, or an unresolvable transform
    /// - [`Error::DependencyNotFound`] for an upstream that is not defined
    /// - [`Error::CycleDetected`] if derived tables depend on each other in a loop
    pub fn build(
        sources: &[String],
        derived: &[DerivedTableSpec],
        catalog: &TransformCatalog,
    ) -> Result<Self> {
        let mut names = BTreeSet::new();
        for name in sources.iter().chain(derived.iter().map(|d| &d.name)) {
            if name.trim().is_empty() {
                return Err(Error::configuration("table names must not be empty"));
            }
            if !names.insert(name.as_str()) {
                return Err(Error::configuration(format!(
                    "table '{name}' is defined more than once"
                )));
            }
        }

        let mut dag = Dag::new();
        let mut nodes = HashMap::new();
        for name in sources.iter().chain(derived.iter().map(|d| &d.name)) {
            nodes.insert(name.clone(), dag.add_node(name.clone()));
        }

        let mut specs = HashMap::new();
        let mut transforms = HashMap::new();
        for spec in derived {
            if spec.upstreams.is_empty() {
                return Err(Error::configuration(format!(
                    "derived table '{}' has no upstreams",
                    spec.name
                )));
            }
            if spec.target_lag.is_zero() {
                return Err(Error::configuration(format!(
                    "derived table '{}' needs a non-zero target lag",
                    spec.name
                )));
            }
            let to = nodes
                .get(&spec.name)
                .copied()
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: spec.name.clone(),
                })?;
            for upstream in &spec.upstreams {
                let from =
                    nodes
                        .get(upstream)
                        .copied()
                        .ok_or_else(|| Error::DependencyNotFound {
                            table: spec.name.clone(),
                            upstream: upstream.clone(),
                        })?;
                dag.add_edge(from, to)?;
            }
            transforms.insert(spec.name.clone(), catalog.resolve(&spec.transform)?);
            specs.insert(spec.name.clone(), spec.clone());
        }

        let refresh_order = dag
            .toposort()?
            .into_iter()
            .filter(|name| specs.contains_key(name))
            .collect();

        Ok(Self {
            sources: sources.iter().cloned().collect(),
            specs,
            transforms,
            refresh_order,
            dag,
        })
    }

    /// Source table names, sorted.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(String::as_str)
    }

    /// Returns true if `name` is a source table.
    #[must_use]
    pub fn is_source(&self, name: &str) -> bool {
        self.sources.contains(name)
    }

    /// Returns true if `name` is any registered table.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.is_source(name) || self.specs.contains_key(name)
    }

    /// Derived table names, upstreams before dependents.
    #[must_use]
    pub fn refresh_order(&self) -> &[String] {
        &self.refresh_order
    }

    /// Definition of a derived table.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&DerivedTableSpec> {
        self.specs.get(name)
    }

    /// Resolved transform of a derived table.
    #[must_use]
    pub fn transform(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(name).cloned()
    }

    /// Derived tables that read `name`, directly or transitively, in refresh order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if `name` is not registered.
    pub fn downstream_of(&self, name: &str) -> Result<Vec<String>> {
        if !self.contains(name) {
            return Err(Error::UnknownTable {
                table: name.to_string(),
            });
        }
        let reached: BTreeSet<String> = self
            .dag
            .transitive_downstream(&name.to_string())?
            .into_iter()
            .collect();
        Ok(self
            .refresh_order
            .iter()
            .filter(|t| reached.contains(*t))
            .cloned()
            .collect())
    }

    /// True if `name` reads different upstreams or runs a different
    /// transform in `self` than in `previous`.
    #[must_use]
    pub fn definition_changed(&self, previous: &Self, name: &str) -> bool {
        match (self.specs.get(name), previous.specs.get(name)) {
            (Some(now), Some(before)) => {
                now.upstreams != before.upstreams || now.transform != before.transform
            }
            _ => false,
        }
    }
}

/// Shared handle to the current registry.
///
/// Readers take a cheap snapshot with [`current`](Self::current); the
/// registry they hold never changes underneath them.
#[derive(Debug)]
pub struct RegistryHandle {
    inner: RwLock<Arc<TableRegistry>>,
}

impl RegistryHandle {
    /// Wraps an initial registry.
    #[must_use]
    pub fn new(registry: TableRegistry) -> Self {
        Self {
            inner: RwLock::new(Arc::new(registry)),
        }
    }

    /// Snapshot of the current registry.
    #[must_use]
    pub fn current(&self) -> Arc<TableRegistry> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Atomically installs `registry`, returning the one it replaced.
    pub fn swap(&self, registry: TableRegistry) -> Arc<TableRegistry> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(registry))
    }
}
