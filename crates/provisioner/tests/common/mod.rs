//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioner::error::ActionError;
use provisioner::runner::{Action, ActionOutput, ActionRunner};
use provisioner::target::{Connection, ResolvedTarget, TargetRole};
use provisioner::verify::{ClusterClient, UnitPhase, UnitSpec, UnitStatus};
use provisioner::{Error, Result};

pub fn local(name: &str) -> ResolvedTarget {
    ResolvedTarget {
        name: name.into(),
        role: TargetRole::ControlPlane,
        connection: Connection::Local,
    }
}

/// Action runner that answers from a script of canned results.
#[derive(Default)]
pub struct FakeRunner {
    actions: Mutex<Vec<(String, Action)>>,
    scripted: Mutex<HashMap<String, VecDeque<std::result::Result<ActionOutput, ActionError>>>>,
    hanging: Mutex<HashSet<String>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue results for `script`; once drained the script succeeds.
    pub fn respond(&self, script: &str, results: Vec<std::result::Result<ActionOutput, ActionError>>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(script.to_string())
            .or_default()
            .extend(results);
    }

    /// Make `script` never finish.
    pub fn hang(&self, script: &str) {
        self.hanging.lock().unwrap().insert(script.to_string());
    }

    /// Scripts run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, a)| a.script.clone())
            .collect()
    }

    /// Scripts run against `target`, in order.
    pub fn calls_on(&self, target: &str) -> Vec<String> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, a)| a.script.clone())
            .collect()
    }

    /// Last action run for `script`.
    pub fn last_action(&self, script: &str) -> Option<Action> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, a)| a.script == script)
            .map(|(_, a)| a.clone())
    }
}

#[async_trait]
impl ActionRunner for FakeRunner {
    async fn run(
        &self,
        target: &ResolvedTarget,
        action: &Action,
    ) -> std::result::Result<ActionOutput, ActionError> {
        self.actions
            .lock()
            .unwrap()
            .push((target.name.clone(), action.clone()));

        if self.hanging.lock().unwrap().contains(&action.script) {
            std::future::pending::<()>().await;
        }

        let next = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&action.script)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(ActionOutput::success(format!("ran {}\n", action.script))))
    }
}

/// How one verification unit behaves in the fake cluster.
#[derive(Clone)]
pub struct UnitPlan {
    /// Phase reported on each poll; the last one repeats.
    pub phases: Vec<UnitPhase>,
    /// Captured output.
    pub logs: String,
    /// Run window the cluster reports once the unit is terminal.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Every status poll fails.
    pub unreachable: bool,
}

impl UnitPlan {
    pub fn with_phases(phases: Vec<UnitPhase>, logs: impl Into<String>) -> Self {
        Self {
            phases,
            logs: logs.into(),
            window: None,
            unreachable: false,
        }
    }

    pub fn completes(logs: impl Into<String>) -> Self {
        Self::with_phases(
            vec![UnitPhase::Pending, UnitPhase::Running, UnitPhase::Succeeded],
            logs,
        )
    }

    pub fn fails(logs: impl Into<String>) -> Self {
        Self::with_phases(vec![UnitPhase::Running, UnitPhase::Failed], logs)
    }

    pub fn stuck(phase: UnitPhase) -> Self {
        Self::with_phases(vec![phase], "")
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::stuck(UnitPhase::Pending)
        }
    }

    pub fn ran_between(mut self, started: DateTime<Utc>, finished: DateTime<Utc>) -> Self {
        self.window = Some((started, finished));
        self
    }
}

/// Cluster whose units follow per-index plans.
#[derive(Default)]
pub struct FakeCluster {
    plans: Mutex<HashMap<u32, UnitPlan>>,
    polls: Mutex<HashMap<String, usize>>,
    rejected: Mutex<HashSet<u32>>,
    pub submitted: Mutex<Vec<String>>,
    pub polled_before_all_submitted: Mutex<bool>,
    pub expected_units: Mutex<usize>,
    pub cleaned: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn with_plans(plans: Vec<UnitPlan>) -> Arc<Self> {
        let cluster = Self::default();
        *cluster.expected_units.lock().unwrap() = plans.len();
        {
            let mut map = cluster.plans.lock().unwrap();
            for (i, plan) in plans.into_iter().enumerate() {
                map.insert(u32::try_from(i).unwrap(), plan);
            }
        }
        Arc::new(cluster)
    }

    pub fn reject(&self, index: u32) {
        self.rejected.lock().unwrap().insert(index);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn submit(&self, unit: &UnitSpec) -> Result<()> {
        if self.rejected.lock().unwrap().contains(&unit.index) {
            return Err(Error::Cluster(format!("quota exceeded for {}", unit.name)));
        }
        self.submitted.lock().unwrap().push(unit.name.clone());
        Ok(())
    }

    async fn status(&self, unit: &UnitSpec) -> Result<UnitStatus> {
        if self.submitted.lock().unwrap().len() + self.rejected.lock().unwrap().len()
            < *self.expected_units.lock().unwrap()
        {
            *self.polled_before_all_submitted.lock().unwrap() = true;
        }

        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&unit.index)
            .cloned()
            .ok_or_else(|| Error::Cluster(format!("no such unit {}", unit.name)))?;
        if plan.unreachable {
            return Err(Error::Cluster("connection refused".into()));
        }
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(unit.name.clone()).or_insert(0);
        let phase = plan.phases[(*count).min(plan.phases.len() - 1)];
        *count += 1;

        let mut status = UnitStatus::new(phase);
        if matches!(phase, UnitPhase::Succeeded | UnitPhase::Failed) {
            if let Some((started, finished)) = plan.window {
                status.started_at = Some(started);
                status.finished_at = Some(finished);
            }
        }
        Ok(status)
    }

    async fn logs(&self, unit: &UnitSpec) -> Result<String> {
        self.plans
            .lock()
            .unwrap()
            .get(&unit.index)
            .map(|p| p.logs.clone())
            .ok_or_else(|| Error::Cluster(format!("no such unit {}", unit.name)))
    }

    async fn cleanup(&self, unit: &UnitSpec) -> Result<()> {
        self.cleaned.lock().unwrap().push(unit.name.clone());
        Ok(())
    }
}
