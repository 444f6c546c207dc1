//! Dependency graph over metric definitions.
//!
//! Edges run from a consumer to the metrics whose cached values it reads. The
//! builder rejects unknown references and cycles up front, so nothing downstream
//! ever evaluates against an invalid graph.

use crate::errors::{AppError, AppResult};
use crate::models::MetricDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum GraphWarning {
    /// An enabled metric reads from a disabled one.
    DisabledDependency { consumer: String, dependency: String },
}

impl std::fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DisabledDependency { consumer, dependency } => write!(
                f,
                "enabled metric '{}' depends on disabled metric '{}'",
                consumer, dependency
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
    warnings: Vec<GraphWarning>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

impl DependencyGraph {
    /// Validates `definitions` and computes a dependency-first evaluation order.
    ///
    /// Roots and sibling dependencies are visited in slug order, so the same
    /// definition set always yields the same order.
    pub fn build(definitions: &[MetricDefinition]) -> AppResult<Self> {
        let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for definition in definitions {
            if dependencies
                .insert(definition.slug.clone(), definition.dependencies.clone())
                .is_some()
            {
                return Err(AppError::InvalidDefinition(format!(
                    "duplicate metric slug '{}'",
                    definition.slug
                )));
            }
        }

        for (slug, deps) in &dependencies {
            if let Some(missing) = deps.iter().find(|dep| !dependencies.contains_key(*dep)) {
                return Err(AppError::DependencyNotFound {
                    metric: slug.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::with_capacity(dependencies.len());
        for slug in dependencies.keys() {
            visit(slug, &dependencies, &mut marks, &mut path, &mut order)?;
        }

        let mut dependents: BTreeMap<String, Vec<String>> =
            dependencies.keys().map(|slug| (slug.clone(), Vec::new())).collect();
        for (consumer, deps) in &dependencies {
            for dep in deps {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(consumer.clone());
                }
            }
        }

        let enabled: HashMap<&str, bool> = definitions
            .iter()
            .map(|def| (def.slug.as_str(), def.enabled))
            .collect();
        let mut warnings = Vec::new();
        for definition in definitions.iter().filter(|def| def.enabled) {
            for dep in &definition.dependencies {
                if enabled.get(dep.as_str()) == Some(&false) {
                    warnings.push(GraphWarning::DisabledDependency {
                        consumer: definition.slug.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        warnings.sort_by_key(|warning| warning.to_string());

        Ok(Self {
            order,
            dependencies,
            dependents,
            warnings,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self, slug: &str) -> Option<usize> {
        self.order.iter().position(|entry| entry == slug)
    }

    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    /// Direct dependencies in declaration order.
    pub fn dependencies_of(&self, slug: &str) -> &[String] {
        self.dependencies.get(slug).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct consumers in slug order.
    pub fn dependents_of(&self, slug: &str) -> &[String] {
        self.dependents.get(slug).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn transitive_dependencies(&self, slug: &str) -> BTreeSet<String> {
        collect_reachable(slug, |node| self.dependencies_of(node))
    }

    pub fn transitive_dependents(&self, slug: &str) -> BTreeSet<String> {
        collect_reachable(slug, |node| self.dependents_of(node))
    }

    /// Members of `slugs` in evaluation order.
    pub fn order_of(&self, slugs: &BTreeSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|slug| slugs.contains(*slug))
            .cloned()
            .collect()
    }
}

fn visit<'a>(
    slug: &'a str,
    dependencies: &'a BTreeMap<String, Vec<String>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> AppResult<()> {
    match marks.get(slug) {
        Some(Mark::Visited) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|entry| *entry == slug).unwrap_or(0);
            let cycle = path[start..].iter().map(|entry| entry.to_string()).collect();
            return Err(AppError::CycleDetected(cycle));
        }
        None => {}
    }

    marks.insert(slug, Mark::Visiting);
    path.push(slug);

    let mut deps: Vec<&String> = dependencies
        .get(slug)
        .map(|deps| deps.iter().collect())
        .unwrap_or_default();
    deps.sort();
    for dep in deps {
        visit(dep, dependencies, marks, path, order)?;
    }

    path.pop();
    marks.insert(slug, Mark::Visited);
    order.push(slug.to_string());
    Ok(())
}

fn collect_reachable<'a>(start: &str, next: impl Fn(&str) -> &'a [String]) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<String> = next(start).to_vec();
    while let Some(slug) = stack.pop() {
        if seen.insert(slug.clone()) {
            stack.extend(next(&slug).iter().cloned());
        }
    }
    seen
}
