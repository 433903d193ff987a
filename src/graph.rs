//! The named task graph.
//!
//! Nodes refer to their dependencies by name only. An edge may point at a name
//! that is not registered (yet, or anymore); such edges are only checked when a
//! run actually reaches them.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::Shared;
use tokio::sync::oneshot;

use crate::error::RunnerError;
use crate::work::{Results, Work};

/// What a node settles with: its own output keyed by its name, or the failure
/// that stopped it.
pub(crate) type Settled = Result<Results, RunnerError>;

/// The shared, in-progress outcome of one node during a run.
pub(crate) type Outcome = Shared<oneshot::Receiver<Settled>>;

/// A normalized list of dependency names.
///
/// Built from nothing (`()`), a single name, or any sequence of names;
/// duplicates are collapsed and the first-seen order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies(Vec<String>);

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<(), RunnerError> {
        if self.0.iter().any(String::is_empty) {
            return Err(RunnerError::InvalidArgument(
                "dependency name must not be empty",
            ));
        }

        Ok(())
    }
}

impl<S> FromIterator<S> for Dependencies
where
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let names = iter
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| seen.insert(name.clone()))
            .collect();

        Self(names)
    }
}

impl From<()> for Dependencies {
    fn from(_: ()) -> Self {
        Dependencies::new()
    }
}

impl From<&str> for Dependencies {
    fn from(name: &str) -> Self {
        std::iter::once(name).collect()
    }
}

impl From<String> for Dependencies {
    fn from(name: String) -> Self {
        std::iter::once(name).collect()
    }
}

impl From<&String> for Dependencies {
    fn from(name: &String) -> Self {
        std::iter::once(name.as_str()).collect()
    }
}

impl From<Vec<&str>> for Dependencies {
    fn from(names: Vec<&str>) -> Self {
        names.into_iter().collect()
    }
}

impl From<Vec<String>> for Dependencies {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<&[&str]> for Dependencies {
    fn from(names: &[&str]) -> Self {
        names.iter().copied().collect()
    }
}

impl From<&[String]> for Dependencies {
    fn from(names: &[String]) -> Self {
        names.iter().map(String::as_str).collect()
    }
}

impl<const N: usize> From<[&str; N]> for Dependencies {
    fn from(names: [&str; N]) -> Self {
        names.into_iter().collect()
    }
}

pub(crate) struct Node {
    pub dependencies: Vec<String>,
    pub work: Work,
    /// On the active resolution path of the current run.
    pub visiting: bool,
    pub in_flight: Option<Outcome>,
}

impl Node {
    fn new(dependencies: Dependencies, work: Work) -> Self {
        Self {
            dependencies: dependencies.0,
            work,
            visiting: false,
            in_flight: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Graph {
    nodes: HashMap<String, Node>,
}

impl Graph {
    pub fn insert(
        &mut self,
        name: &str,
        dependencies: Dependencies,
        work: Work,
        overwrite: bool,
    ) -> Result<(), RunnerError> {
        dependencies.validate()?;

        if !overwrite && self.nodes.contains_key(name) {
            return Err(RunnerError::AlreadyExists(name.to_string()));
        }

        self.nodes
            .insert(name.to_string(), Node::new(dependencies, work));

        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn add_dependencies(
        &mut self,
        name: &str,
        dependencies: Dependencies,
    ) -> Result<(), RunnerError> {
        dependencies.validate()?;

        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| RunnerError::TaskNotFound(name.to_string()))?;

        let known: HashSet<String> = node.dependencies.iter().cloned().collect();
        node.dependencies.extend(
            dependencies
                .0
                .into_iter()
                .filter(|dep| !known.contains(dep)),
        );

        Ok(())
    }

    pub fn remove_dependencies(&mut self, name: &str, dependencies: &Dependencies) {
        if let Some(node) = self.nodes.get_mut(name) {
            let strip: HashSet<&str> = dependencies.0.iter().map(String::as_str).collect();
            node.dependencies.retain(|dep| !strip.contains(dep.as_str()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.dependencies.clone()))
            .collect()
    }

    /// Puts every traversal marker back to rest.
    pub fn reset_markers(&mut self) {
        for node in self.nodes.values_mut() {
            node.visiting = false;
            node.in_flight = None;
        }
    }

    #[cfg(test)]
    pub fn is_at_rest(&self) -> bool {
        self.nodes
            .values()
            .all(|node| !node.visiting && node.in_flight.is_none())
    }
}
