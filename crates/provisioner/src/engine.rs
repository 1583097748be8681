//! Stage execution engine.
//!
//! Runs stages against a resolved target one at a time, consulting and
//! updating the state store around every attempt:
//! - dependencies must be satisfied before an action is attempted
//! - a success with an unchanged idempotency key is re-confirmed, not re-run
//! - retryable failures are retried with exponential backoff
//! - failures block dependents; independent stages follow the failure policy

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SecretSpec;
use crate::error::{ActionError, Error, Result};
use crate::graph::StageGraph;
use crate::report::{Operation, RunReport, StageOutcome};
use crate::runner::{Action, ActionOutput, ActionRunner, Secret};
use crate::stage::Stage;
use crate::state::{ExecutionRecord, StageStatus, StateStore};
use crate::target::ResolvedTarget;

/// Most stderr carried into a failure message.
const STDERR_TAIL_CHARS: usize = 2000;

/// What to do with stages independent of a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop launching stages after the first failure.
    #[default]
    FailFast,
    /// Keep running stages that do not depend on a failed stage.
    KeepGoing,
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-run stages even when their idempotency key matches.
    pub force: bool,
    /// Failure policy.
    pub policy: FailurePolicy,
    /// Restrict the run to these stages (plus dependencies on install).
    pub only: Vec<String>,
}

/// Executes stages and plans against targets.
#[derive(Clone)]
pub struct Engine {
    store: Arc<StateStore>,
    runner: Arc<dyn ActionRunner>,
    secrets: BTreeMap<String, SecretSpec>,
    cancel: CancellationToken,
}

impl Engine {
    /// Create an engine over a state store and an action transport.
    #[must_use]
    pub fn new(store: Arc<StateStore>, runner: Arc<dyn ActionRunner>) -> Self {
        Self {
            store,
            runner,
            secrets: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Named secrets available to stages that reference them.
    #[must_use]
    pub fn with_secrets(mut self, secrets: BTreeMap<String, SecretSpec>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Token that aborts the run when cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Execute one stage on one target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyNotSatisfied`] without attempting the
    /// action if a dependency has not succeeded, [`Error::StageFailed`] once
    /// the action failed fatally or exhausted its retries, and state store
    /// errors if a transition cannot be persisted.
    pub async fn execute(
        &self,
        target: &ResolvedTarget,
        stage: &Stage,
        force: bool,
    ) -> Result<ExecutionRecord> {
        for dep in &stage.depends_on {
            let status = self
                .store
                .get(&target.name, dep)?
                .map_or(StageStatus::Pending, |r| r.status);
            if !status.is_satisfied() {
                return Err(Error::DependencyNotSatisfied {
                    target: target.name.clone(),
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                    status: status.to_string(),
                });
            }
        }

        let key = stage.idempotency_key(target);
        let existing = self.store.get(&target.name, &stage.id)?;

        if let Some(record) = &existing {
            let same_key = record.idempotency_key.as_deref() == Some(key.as_str());
            if !force && record.status.is_satisfied() && same_key {
                info!(target = %target.name, stage = %stage.id, "Already applied, skipping");
                let skipped = record.transition(StageStatus::Skipped);
                self.store.put(&target.name, &stage.id, skipped.clone())?;
                return Ok(skipped);
            }
            if record.status.is_satisfied() && !same_key {
                info!(target = %target.name, stage = %stage.id, "Stage definition changed, re-running");
            }
            if record.status == StageStatus::Unknown {
                warn!(target = %target.name, stage = %stage.id, "Previous outcome unknown, re-running");
            }
        }

        let base = existing
            .unwrap_or_else(|| ExecutionRecord::pending(&target.name, &stage.id));

        let action = match self.action_for(stage, &stage.run) {
            Ok(action) => action,
            Err(e) => return Err(self.fail(target, stage, &stage.id, base, 0, None, e)?),
        };

        let mut record = self.drive(target, stage, &stage.id, &action, base).await?;
        record.status = StageStatus::Succeeded;
        record.idempotency_key = Some(key);
        record.error = None;
        record.updated_at = chrono::Utc::now();
        self.store.put(&target.name, &stage.id, record.clone())?;

        info!(
            target = %target.name,
            stage = %stage.id,
            attempts = record.attempts,
            "Stage succeeded"
        );
        Ok(record)
    }

    /// Run the install plan for one target.
    ///
    /// Records are created `pending` for every planned stage that has none,
    /// then stages run in install order. The returned report lists every
    /// planned stage; only infrastructure failures (state store, bad
    /// selection) are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection is invalid or state cannot be persisted.
    pub async fn install(
        &self,
        target: &ResolvedTarget,
        graph: &StageGraph,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let stages = if options.only.is_empty() {
            graph.install_order()
        } else {
            graph.select(&options.only)?
        };

        for stage in &stages {
            if self.store.get(&target.name, &stage.id)?.is_none() {
                self.store.put(
                    &target.name,
                    &stage.id,
                    ExecutionRecord::pending(&target.name, &stage.id),
                )?;
            }
        }

        info!(target = %target.name, stages = stages.len(), "Starting install");
        let mut report = RunReport::new(&target.name, Operation::Install);
        let mut broken: HashSet<String> = HashSet::new();
        let mut halted = false;

        for stage in stages {
            if !halted && self.cancel.is_cancelled() {
                warn!(target = %target.name, "Install aborted, not launching further stages");
                report.aborted = true;
                halted = true;
            }
            if let Some(dep) = stage.depends_on.iter().find(|d| broken.contains(*d)) {
                warn!(target = %target.name, stage = %stage.id, blocked_by = %dep, "Stage blocked");
                broken.insert(stage.id.clone());
                report.push(&stage.id, StageOutcome::Blocked { by: dep.clone() });
                continue;
            }
            if halted {
                report.push(&stage.id, StageOutcome::NotAttempted);
                continue;
            }

            match self.execute(target, stage, options.force).await {
                Ok(record) if record.status == StageStatus::Skipped => {
                    report.push(&stage.id, StageOutcome::Skipped);
                }
                Ok(record) => {
                    report.push(
                        &stage.id,
                        StageOutcome::Succeeded {
                            attempts: record.attempts,
                        },
                    );
                }
                Err(Error::DependencyNotSatisfied { dependency, .. }) => {
                    broken.insert(stage.id.clone());
                    report.push(&stage.id, StageOutcome::Blocked { by: dependency });
                }
                Err(Error::StageFailed {
                    attempts,
                    output,
                    source,
                    ..
                }) => {
                    broken.insert(stage.id.clone());
                    let cancelled = source == ActionError::Cancelled;
                    report.push(
                        &stage.id,
                        StageOutcome::Failed {
                            attempts,
                            error: source.to_string(),
                            output,
                        },
                    );
                    if cancelled {
                        report.aborted = true;
                        halted = true;
                    } else if options.policy == FailurePolicy::FailFast {
                        halted = true;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        report.finish();
        info!(
            target = %target.name,
            actions = report.actions_taken(),
            failures = report.failures().len(),
            blocked = report.blocked().len(),
            "Install finished"
        );
        Ok(report)
    }

    /// Run the teardown plan for one target, in exact reverse install order.
    ///
    /// A stage is removed only after every stage depending on it was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection is invalid or state cannot be persisted.
    pub async fn uninstall(
        &self,
        target: &ResolvedTarget,
        graph: &StageGraph,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let mut stages = if options.only.is_empty() {
            graph.install_order()
        } else {
            for id in &options.only {
                if graph.get(id).is_none() {
                    return Err(Error::Config(format!("Unknown stage: {id}")));
                }
            }
            graph
                .install_order()
                .into_iter()
                .filter(|s| options.only.contains(&s.id))
                .collect()
        };
        stages.reverse();

        info!(target = %target.name, stages = stages.len(), "Starting uninstall");
        let mut report = RunReport::new(&target.name, Operation::Uninstall);
        let mut kept: HashSet<String> = HashSet::new();
        let mut halted = false;

        for stage in stages {
            if !halted && self.cancel.is_cancelled() {
                warn!(target = %target.name, "Uninstall aborted, not removing further stages");
                report.aborted = true;
                halted = true;
            }
            // Dependents outside a partial selection must already be gone.
            let mut blocker = None;
            for dependent in graph.dependents(&stage.id) {
                let still_installed = self
                    .store
                    .get(&target.name, &dependent.id)?
                    .is_some_and(|r| r.status != StageStatus::Pending);
                if kept.contains(&dependent.id) || still_installed {
                    blocker = Some(dependent.id.clone());
                    break;
                }
            }
            if let Some(by) = blocker {
                warn!(target = %target.name, stage = %stage.id, blocked_by = %by, "Teardown blocked");
                kept.insert(stage.id.clone());
                report.push(&stage.id, StageOutcome::Blocked { by });
                continue;
            }
            if halted {
                report.push(&stage.id, StageOutcome::NotAttempted);
                continue;
            }

            let Some(record) = self.store.get(&target.name, &stage.id)? else {
                report.push(&stage.id, StageOutcome::Absent);
                continue;
            };
            if record.status == StageStatus::Pending {
                self.store.remove(&target.name, &stage.id)?;
                report.push(&stage.id, StageOutcome::Absent);
                continue;
            }

            let Some(script) = &stage.teardown else {
                self.store.remove(&target.name, &stage.id)?;
                info!(target = %target.name, stage = %stage.id, "No teardown action, record cleared");
                report.push(&stage.id, StageOutcome::Cleared);
                continue;
            };

            let label = format!("{}.teardown", stage.id);
            let outcome = match self.action_for(stage, script) {
                Ok(action) => self.drive(target, stage, &label, &action, record).await,
                Err(e) => Err(self.fail(target, stage, &label, record, 0, None, e)?),
            };

            match outcome {
                Ok(done) => {
                    self.store.remove(&target.name, &stage.id)?;
                    info!(target = %target.name, stage = %stage.id, "Stage removed");
                    report.push(
                        &stage.id,
                        StageOutcome::Removed {
                            attempts: done.attempts,
                        },
                    );
                }
                Err(Error::StageFailed {
                    attempts,
                    output,
                    source,
                    ..
                }) => {
                    kept.insert(stage.id.clone());
                    let cancelled = source == ActionError::Cancelled;
                    report.push(
                        &stage.id,
                        StageOutcome::Failed {
                            attempts,
                            error: source.to_string(),
                            output,
                        },
                    );
                    if cancelled {
                        report.aborted = true;
                        halted = true;
                    } else if options.policy == FailurePolicy::FailFast {
                        halted = true;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        report.finish();
        info!(
            target = %target.name,
            actions = report.actions_taken(),
            failures = report.failures().len(),
            "Uninstall finished"
        );
        Ok(report)
    }

    /// Install on several independent targets concurrently.
    ///
    /// Each target gets its own sequential plan; nothing is shared between
    /// them except the state store.
    ///
    /// # Errors
    ///
    /// Returns the first infrastructure error from any target.
    pub async fn install_all(
        &self,
        targets: Vec<ResolvedTarget>,
        graph: Arc<StageGraph>,
        options: RunOptions,
    ) -> Result<Vec<RunReport>> {
        let mut set = JoinSet::new();
        for target in targets {
            let engine = self.clone();
            let graph = Arc::clone(&graph);
            let options = options.clone();
            set.spawn(async move { engine.install(&target, &graph, &options).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            let report = joined.map_err(|e| Error::Internal(format!("install task failed: {e}")))??;
            reports.push(report);
        }
        reports.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(reports)
    }

    /// Build the action for a script of `stage`, injecting its secret.
    fn action_for(&self, stage: &Stage, script: &str) -> std::result::Result<Action, ActionError> {
        let mut action = Action::script(script, stage.timeout());
        action.env.clone_from(&stage.params);

        if let Some(name) = &stage.secret {
            let spec = self.secrets.get(name).ok_or_else(|| {
                ActionError::MalformedAction(format!("secret '{name}' is not defined"))
            })?;
            let value = std::env::var(&spec.env)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ActionError::MalformedAction(format!(
                        "secret '{name}' requires {} to be set",
                        spec.env
                    ))
                })?;
            action.secret = Some(Secret {
                env: spec.env.clone(),
                value,
            });
        }

        Ok(action)
    }

    /// Attempt an action until it succeeds, fails fatally or runs out of retries.
    ///
    /// Persists a `running` transition before every attempt. On success the
    /// returned record carries the attempt count and output reference but is
    /// not yet persisted with its final status.
    async fn drive(
        &self,
        target: &ResolvedTarget,
        stage: &Stage,
        label: &str,
        action: &Action,
        base: ExecutionRecord,
    ) -> Result<ExecutionRecord> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut running = base.transition(StageStatus::Running);
            running.attempts = attempts;
            running.error = None;
            self.store.put(&target.name, &stage.id, running.clone())?;

            info!(
                target = %target.name,
                stage = %label,
                attempt = attempts,
                max_attempts = stage.retry.max_attempts,
                "Running stage action"
            );

            let result = self.attempt(target, action).await;
            let (failure, log) = match result {
                Ok(output) if stage.tolerates(output.exit_code) => {
                    let path = self
                        .store
                        .write_log(&target.name, label, attempts, &output.combined())?;
                    running.output = Some(path);
                    running.last_signal = Some(format!("exit:{}", output.exit_code));
                    return Ok(running);
                }
                Ok(output) => {
                    let failure = ActionError::CommandFailure {
                        code: output.exit_code,
                        stderr: tail(&output.stderr, STDERR_TAIL_CHARS),
                    };
                    (failure, output.combined())
                }
                Err(e) => {
                    let log = e.to_string();
                    (e, log)
                }
            };

            let path = self.store.write_log(&target.name, label, attempts, &log)?;

            if failure.is_retryable() && stage.retry.should_retry(attempts) {
                let delay = stage.retry.delay_for_attempt(attempts);
                warn!(
                    target = %target.name,
                    stage = %label,
                    attempt = attempts,
                    error = %failure,
                    delay_secs = delay.as_secs(),
                    "Retryable failure, backing off"
                );
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Err(self.fail(
                            target, stage, label, running, attempts, Some(path), ActionError::Cancelled,
                        )?);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            return Err(self.fail(target, stage, label, running, attempts, Some(path), failure)?);
        }
    }

    /// One attempt, bounded by the action timeout and the cancellation token.
    async fn attempt(
        &self,
        target: &ResolvedTarget,
        action: &Action,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let run = self.runner.run(target, action);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ActionError::Cancelled),
            result = tokio::time::timeout(action.timeout, run) => {
                result.unwrap_or_else(|_| Err(ActionError::Timeout(action.timeout.as_secs())))
            }
        }
    }

    /// Persist a `failed` record and build the error describing it.
    ///
    /// The outer `Result` carries state store failures; the inner error is
    /// the stage failure to hand back to the caller.
    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        target: &ResolvedTarget,
        stage: &Stage,
        label: &str,
        base: ExecutionRecord,
        attempts: u32,
        output: Option<std::path::PathBuf>,
        source: ActionError,
    ) -> Result<Error> {
        let mut record = base.transition(StageStatus::Failed);
        record.attempts = attempts;
        record.last_signal = Some(source.signal());
        record.error = Some(source.to_string());
        if output.is_some() {
            record.output.clone_from(&output);
        }
        self.store.put(&target.name, &stage.id, record)?;

        error!(
            target = %target.name,
            stage = %label,
            attempts,
            error = %source,
            "Stage failed"
        );

        Ok(Error::StageFailed {
            target: target.name.clone(),
            stage: stage.id.clone(),
            attempts,
            output,
            source,
        })
    }
}

/// Last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail() {
        assert_eq!(tail("abc\n", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
    }
}
