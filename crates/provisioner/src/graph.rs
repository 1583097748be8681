//! Stage dependency graph.
//!
//! Validates a set of stage definitions once, up front, and exposes the
//! deterministic install order, its exact reverse for teardown, and the
//! subset of stages that still need to run for a given state snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::stage::Stage;
use crate::state::StageStatus;

/// A validated, acyclic set of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declaration order.
    stages: Vec<Stage>,
    /// Stage id -> declaration index.
    index: HashMap<String, usize>,
    /// Declaration index -> indices of stages that depend on it.
    dependents: Vec<Vec<usize>>,
    /// Topological order as declaration indices.
    order: Vec<usize>,
}

impl StageGraph {
    /// Build the graph, failing on duplicate ids, unknown dependencies or cycles.
    ///
    /// Ties between stages with no mutual dependency are broken by
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStage`], [`Error::UnknownDependency`] or
    /// [`Error::CyclicDependency`].
    pub fn build(stages: Vec<Stage>) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(Error::DuplicateStage(stage.id.clone()));
            }
        }

        // Deduplicated dependency indices per stage.
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(stages.len());
        for stage in &stages {
            let mut seen = BTreeSet::new();
            for dep in &stage.depends_on {
                let &d = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                })?;
                seen.insert(d);
            }
            deps.push(seen.into_iter().collect());
        }

        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(stages.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &dependents[next] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < stages.len() {
            let cycle = find_cycle(&stages, &deps, &in_degree);
            return Err(Error::CyclicDependency { cycle });
        }

        Ok(Self {
            stages,
            index,
            dependents,
            order,
        })
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Look up a stage by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Stage> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Deterministic install order.
    #[must_use]
    pub fn install_order(&self) -> Vec<&Stage> {
        self.order.iter().map(|&i| &self.stages[i]).collect()
    }

    /// Exact reverse of the install order.
    ///
    /// Every stage appears after all stages that depend on it.
    #[must_use]
    pub fn teardown_order(&self) -> Vec<&Stage> {
        self.order.iter().rev().map(|&i| &self.stages[i]).collect()
    }

    /// Stages that directly depend on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&Stage> {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.stages[d]).collect())
            .unwrap_or_default()
    }

    /// Ordered subset of stages that still need to run.
    ///
    /// Stages whose snapshot status is already satisfied are omitted unless
    /// `force` is set.
    #[must_use]
    pub fn pending(&self, snapshot: &BTreeMap<String, StageStatus>, force: bool) -> Vec<&Stage> {
        self.install_order()
            .into_iter()
            .filter(|stage| {
                force
                    || !snapshot
                        .get(&stage.id)
                        .is_some_and(|status| status.is_satisfied())
            })
            .collect()
    }

    /// The named stages plus all their transitive dependencies, in install order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a requested id is not defined.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&Stage>> {
        let mut wanted = HashSet::new();
        let mut stack = Vec::new();
        for id in ids {
            let &i = self
                .index
                .get(id)
                .ok_or_else(|| Error::Config(format!("Unknown stage: {id}")))?;
            stack.push(i);
        }

        while let Some(i) = stack.pop() {
            if wanted.insert(i) {
                for dep in &self.stages[i].depends_on {
                    if let Some(&d) = self.index.get(dep) {
                        stack.push(d);
                    }
                }
            }
        }

        Ok(self
            .order
            .iter()
            .filter(|i| wanted.contains(*i))
            .map(|&i| &self.stages[i])
            .collect())
    }
}

/// Extract one cycle from the nodes Kahn's algorithm could not order.
///
/// Every leftover node still has at least one leftover dependency, so
/// walking dependencies from any leftover node must revisit a node.
fn find_cycle(stages: &[Stage], deps: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
    let Some(start) = (0..stages.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = deps[current].iter().find(|&&d| in_degree[d] > 0) else {
            break;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| stages[i].id.clone()).collect();
            cycle.push(stages[next].id.clone());
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| stages[i].id.clone()).collect()
}
