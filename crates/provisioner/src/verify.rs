//! GPU verification runner.
//!
//! Submits a batch of synthetic workload units to the cluster, waits on all
//! of them concurrently and certifies each one by the literal presence of a
//! success marker in its captured output. Units that ran at the same time
//! must not report the same device unless the job asks for shared devices.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default per-unit timeout.
pub const DEFAULT_UNIT_TIMEOUT_SECS: u64 = 600;

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default namespace for verification units.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Extended resource requested for each device.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Consecutive cluster API failures tolerated while watching one unit.
const MAX_CONSECUTIVE_API_ERRORS: u32 = 5;

/// Log lines kept in a unit's excerpt.
const EXCERPT_LINES: usize = 20;

const MANAGED_BY: &str = "provisioner";

const CONTAINER: &str = "verify";

static DEVICE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"GPU-[0-9a-fA-F]{8}(?:-[0-9a-fA-F]{4}){3}-[0-9a-fA-F]{12}")
        .expect("device id pattern is valid")
});

fn default_devices_per_unit() -> u32 {
    1
}

fn default_unit_timeout() -> u64 {
    DEFAULT_UNIT_TIMEOUT_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// A verification job as declared in the run file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationJob {
    /// Job name.
    pub name: String,
    /// Number of units run concurrently.
    pub parallelism: u32,
    /// Devices requested by each unit.
    #[serde(default = "default_devices_per_unit")]
    pub devices_per_unit: u32,
    /// Container image of each unit.
    pub image: String,
    /// Shell command run in the container; the image entrypoint when absent.
    #[serde(default)]
    pub command: Option<String>,
    /// Literal string that certifies a unit's output.
    pub success_marker: String,
    /// Seconds a unit may take to reach a terminal state.
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,
    /// Seconds between status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Units may legitimately report the same device.
    #[serde(default)]
    pub shared_devices: bool,
    /// Namespace units are created in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Runtime class for the unit pods (e.g. `nvidia`).
    #[serde(default)]
    pub runtime_class: Option<String>,
    /// Leave units in the cluster after the run.
    #[serde(default)]
    pub keep_units: bool,
}

impl VerificationJob {
    /// A job with defaults for everything but the essentials.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        parallelism: u32,
        image: impl Into<String>,
        success_marker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parallelism,
            devices_per_unit: default_devices_per_unit(),
            image: image.into(),
            command: None,
            success_marker: success_marker.into(),
            unit_timeout_secs: DEFAULT_UNIT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            shared_devices: false,
            namespace: default_namespace(),
            runtime_class: None,
            keep_units: false,
        }
    }

    /// Check the job can be submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::Config(format!(
                "Verification job '{}': {reason}",
                self.name
            )))
        };

        if self.name.trim().is_empty() {
            return Err(Error::Config("Verification job name is empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return fail("name must be lowercase alphanumerics and '-'");
        }
        if self.parallelism == 0 {
            return fail("parallelism must be at least 1");
        }
        if self.devices_per_unit == 0 {
            return fail("devices_per_unit must be at least 1");
        }
        if self.image.trim().is_empty() {
            return fail("image is empty");
        }
        if self.success_marker.is_empty() {
            return fail("success_marker is empty");
        }
        if self.unit_timeout_secs == 0 {
            return fail("unit_timeout_secs must be positive");
        }
        if self.poll_interval_secs == 0 {
            return fail("poll_interval_secs must be positive");
        }
        Ok(())
    }

    /// Per-unit timeout.
    #[must_use]
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    /// Poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Unit descriptors for one run.
    #[must_use]
    pub fn units(&self, run_id: &str) -> Vec<UnitSpec> {
        (0..self.parallelism)
            .map(|index| UnitSpec {
                name: format!("{}-{run_id}-{index}", self.name),
                job: self.name.clone(),
                run_id: run_id.to_string(),
                index,
                namespace: self.namespace.clone(),
                image: self.image.clone(),
                command: self.command.clone(),
                devices: self.devices_per_unit,
                runtime_class: self.runtime_class.clone(),
                timeout_secs: self.unit_timeout_secs,
            })
            .collect()
    }
}

/// One workload unit as submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// Cluster object name.
    pub name: String,
    /// Owning job name.
    pub job: String,
    /// Run id shared by all units of one invocation.
    pub run_id: String,
    /// Position in the batch.
    pub index: u32,
    /// Namespace.
    pub namespace: String,
    /// Image.
    pub image: String,
    /// Shell command.
    pub command: Option<String>,
    /// Devices requested.
    pub devices: u32,
    /// Runtime class.
    pub runtime_class: Option<String>,
    /// Deadline enforced by the cluster as well.
    pub timeout_secs: u64,
}

/// Phase of a unit as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// Accepted but not yet running.
    Pending,
    /// Running.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited unsuccessfully or was rejected.
    Failed,
}

/// What the cluster reports about a unit on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    /// Current phase.
    pub phase: UnitPhase,
    /// When the workload started running, if the cluster recorded it.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workload exited, if the cluster recorded it.
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitStatus {
    /// A status without recorded run times.
    #[must_use]
    pub fn new(phase: UnitPhase) -> Self {
        Self {
            phase,
            started_at: None,
            finished_at: None,
        }
    }
}

impl From<UnitPhase> for UnitStatus {
    fn from(phase: UnitPhase) -> Self {
        Self::new(phase)
    }
}

/// Cluster operations needed to run verification units.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the unit.
    async fn submit(&self, unit: &UnitSpec) -> Result<()>;

    /// Current phase of the unit and its run window as far as known.
    async fn status(&self, unit: &UnitSpec) -> Result<UnitStatus>;

    /// Captured standard output of the unit.
    async fn logs(&self, unit: &UnitSpec) -> Result<String>;

    /// Delete the unit and anything it created.
    async fn cleanup(&self, unit: &UnitSpec) -> Result<()>;
}

/// Kubernetes implementation: one `batch/v1` Job per unit.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create a cluster client from a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cluster`] if the kubeconfig cannot be read or the
    /// client cannot be created.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::Cluster(format!("Failed to read kubeconfig from {}: {e}", path.display()))
        })?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Cluster(format!("Failed to create Kubernetes config: {e}")))?;

        let client = Client::try_from(config)
            .map_err(|e| Error::Cluster(format!("Failed to create Kubernetes client: {e}")))?;

        Ok(Self { client })
    }

    fn jobs(&self, unit: &UnitSpec) -> Api<Job> {
        Api::namespaced(self.client.clone(), &unit.namespace)
    }

    fn pods(&self, unit: &UnitSpec) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &unit.namespace)
    }

    async fn unit_pod(&self, unit: &UnitSpec) -> Result<Option<Pod>> {
        let list = self
            .pods(unit)
            .list(&ListParams::default().labels(&format!("job-name={}", unit.name)))
            .await
            .map_err(|e| Error::Cluster(format!("Failed to list pods of {}: {e}", unit.name)))?;
        Ok(list.items.into_iter().next())
    }
}

/// Job manifest for a unit.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the manifest does not deserialize.
pub fn build_job(unit: &UnitSpec) -> Result<Job> {
    let mut container = json!({
        "name": CONTAINER,
        "image": unit.image,
        "resources": {
            "limits": { GPU_RESOURCE: unit.devices.to_string() }
        }
    });
    if let Some(command) = &unit.command {
        container["command"] = json!(["sh", "-c", command]);
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
        "tolerations": [{
            "key": GPU_RESOURCE,
            "operator": "Exists",
            "effect": "NoSchedule"
        }]
    });
    if let Some(class) = &unit.runtime_class {
        pod_spec["runtimeClassName"] = json!(class);
    }

    let labels = json!({
        "app.kubernetes.io/managed-by": MANAGED_BY,
        "provisioner/verification": unit.job,
        "provisioner/run": unit.run_id,
    });

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": unit.name,
            "namespace": unit.namespace,
            "labels": labels
        },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": unit.timeout_secs,
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec
            }
        }
    });

    serde_json::from_value(job)
        .map_err(|e| Error::Internal(format!("invalid job manifest for {}: {e}", unit.name)))
}

/// Terminal phase from the Job's conditions or counters.
fn job_phase(status: &JobStatus) -> Option<UnitPhase> {
    for condition in status.conditions.iter().flatten() {
        if condition.status == "True" {
            match condition.type_.as_str() {
                "Complete" => return Some(UnitPhase::Succeeded),
                "Failed" => return Some(UnitPhase::Failed),
                _ => {}
            }
        }
    }
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(UnitPhase::Succeeded);
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(UnitPhase::Failed);
    }
    None
}

/// Start and exit time of the unit container as recorded by the kubelet.
fn run_window(status: &PodStatus) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let state = status
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == CONTAINER)
        .and_then(|c| c.state.as_ref());

    if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        return (
            terminated.started_at.as_ref().map(|t| t.0),
            terminated.finished_at.as_ref().map(|t| t.0),
        );
    }
    let started = state
        .and_then(|s| s.running.as_ref())
        .and_then(|r| r.started_at.as_ref())
        .map(|t| t.0);
    (started, None)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn submit(&self, unit: &UnitSpec) -> Result<()> {
        let job = build_job(unit)?;
        self.jobs(unit)
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::Cluster(format!("Failed to create job {}: {e}", unit.name)))?;
        debug!(unit = %unit.name, "Created verification job");
        Ok(())
    }

    async fn status(&self, unit: &UnitSpec) -> Result<UnitStatus> {
        let job = self
            .jobs(unit)
            .get(&unit.name)
            .await
            .map_err(|e| Error::Cluster(format!("Failed to get job {}: {e}", unit.name)))?;

        let pod_status = self.unit_pod(unit).await?.and_then(|pod| pod.status);
        let pod_phase = pod_status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(|phase| match phase {
                "Running" => UnitPhase::Running,
                "Succeeded" => UnitPhase::Succeeded,
                "Failed" => UnitPhase::Failed,
                _ => UnitPhase::Pending,
            });

        let phase = job
            .status
            .as_ref()
            .and_then(job_phase)
            .or(pod_phase)
            .unwrap_or(UnitPhase::Pending);
        let (started_at, finished_at) = pod_status.as_ref().map(run_window).unwrap_or_default();

        Ok(UnitStatus {
            phase,
            started_at,
            finished_at,
        })
    }

    async fn logs(&self, unit: &UnitSpec) -> Result<String> {
        let Some(pod) = self.unit_pod(unit).await? else {
            return Err(Error::Cluster(format!("No pod found for {}", unit.name)));
        };
        let name = pod.metadata.name.unwrap_or_default();
        self.pods(unit)
            .logs(&name, &LogParams::default())
            .await
            .map_err(|e| Error::Cluster(format!("Failed to fetch logs of {name}: {e}")))
    }

    async fn cleanup(&self, unit: &UnitSpec) -> Result<()> {
        match self.jobs(unit).delete(&unit.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Cluster(format!("Failed to delete job {}: {e}", unit.name))),
        }
    }
}

/// States a unit passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    /// Accepted by the cluster.
    Submitted,
    /// Observed running.
    Running,
    /// Exited successfully.
    Completed,
    /// Exited unsuccessfully.
    Failed,
    /// Never reached a terminal state in time.
    TimedOut,
}

/// Final classification of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitOutcome {
    /// Completed and emitted the marker.
    Matched,
    /// Completed without the marker.
    Mismatched,
    /// Failed, or could not be submitted or observed.
    Failed,
    /// Did not finish within its timeout, or the run was aborted.
    TimedOut,
}

impl std::fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Mismatched => write!(f, "mismatched"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// Per-unit detail.
#[derive(Debug, Clone, Serialize)]
pub struct UnitResult {
    /// Unit name.
    pub unit: String,
    /// Position in the batch.
    pub index: u32,
    /// Final outcome.
    pub outcome: UnitOutcome,
    /// State transitions in order.
    pub transitions: Vec<UnitState>,
    /// Device identities found in the output.
    pub devices: Vec<String>,
    /// Tail of the captured output.
    pub excerpt: String,
    /// When the cluster accepted the unit.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Start of the running window.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the running window.
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the unit did not match.
    pub error: Option<String>,
    /// Device shared with a concurrently running unit.
    pub conflict: Option<String>,
}

impl UnitResult {
    fn new(unit: &UnitSpec) -> Self {
        Self {
            unit: unit.name.clone(),
            index: unit.index,
            outcome: UnitOutcome::Failed,
            transitions: Vec::new(),
            devices: Vec::new(),
            excerpt: String::new(),
            submitted_at: None,
            started_at: None,
            finished_at: None,
            error: None,
            conflict: None,
        }
    }

    fn enter(&mut self, state: UnitState) {
        if state == UnitState::Submitted {
            self.submitted_at = Some(Utc::now());
        }
        self.transitions.push(state);
    }

    fn state(&self) -> Option<UnitState> {
        self.transitions.last().copied()
    }

    /// Enter `running` once, with the window opening at `at`.
    fn start(&mut self, at: DateTime<Utc>) {
        if self.state() != Some(UnitState::Running) {
            self.enter(UnitState::Running);
            self.started_at = Some(at);
        }
    }

    /// End a unit that was never seen exiting. Passes through `running`
    /// without opening a window, since no run time is known.
    fn abandon(&mut self, state: UnitState, outcome: UnitOutcome, reason: impl Into<String>) {
        if self.state() != Some(UnitState::Running) {
            self.transitions.push(UnitState::Running);
        }
        self.enter(state);
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self.error = Some(reason.into());
    }

    fn time_out(&mut self, reason: impl Into<String>) {
        self.abandon(UnitState::TimedOut, UnitOutcome::TimedOut, reason);
    }

    /// Whether the unit certifies the job.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == UnitOutcome::Matched && self.conflict.is_none()
    }

    /// Whether this unit's running window overlaps another's.
    fn overlaps(&self, other: &Self) -> bool {
        let (Some(a_start), Some(b_start)) = (self.started_at, other.started_at) else {
            return false;
        };
        let a_end = self.finished_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        let b_end = other.finished_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        a_start <= b_end && b_start <= a_end
    }
}

/// Aggregate classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every unit matched.
    AllPassed,
    /// Some units matched.
    PartialFailure,
    /// No unit matched.
    AllFailed,
}

/// Two concurrently running units reported the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConflict {
    /// Device identity.
    pub device: String,
    /// Units involved.
    pub units: (String, String),
}

/// Result of one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    /// Job name.
    pub job: String,
    /// Marker tested for.
    pub marker: String,
    /// Run id.
    pub run_id: String,
    /// Aggregate verdict.
    pub verdict: Verdict,
    /// Per-unit detail, ordered by index.
    pub units: Vec<UnitResult>,
    /// Device overlaps between concurrent units.
    pub conflicts: Vec<DeviceConflict>,
    /// Whether the run was aborted.
    pub aborted: bool,
}

impl VerificationResult {
    fn assemble(job: &VerificationJob, run_id: String, mut units: Vec<UnitResult>, aborted: bool) -> Self {
        units.sort_by_key(|u| u.index);
        let conflicts = if job.shared_devices {
            Vec::new()
        } else {
            find_conflicts(&mut units)
        };

        let passed = units.iter().filter(|u| u.passed()).count();
        let verdict = if passed == units.len() {
            Verdict::AllPassed
        } else if passed == 0 {
            Verdict::AllFailed
        } else {
            Verdict::PartialFailure
        };

        Self {
            job: job.name.clone(),
            marker: job.success_marker.clone(),
            run_id,
            verdict,
            units,
            conflicts,
            aborted,
        }
    }

    /// Whether every unit matched without device conflicts.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::AllPassed && !self.aborted
    }

    /// Units that did not pass.
    #[must_use]
    pub fn failing(&self) -> Vec<&UnitResult> {
        self.units.iter().filter(|u| !u.passed()).collect()
    }

    /// Turn the verdict into an error for the caller.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if aborted. When no unit passed,
    /// [`Error::VerificationMismatch`] if every unit completed without the
    /// marker and [`Error::VerificationFailed`] otherwise. When some passed,
    /// [`Error::PartialParallelFailure`].
    pub fn ensure_passed(&self) -> Result<()> {
        if self.aborted {
            return Err(Error::Cancelled);
        }
        if self.passed() {
            return Ok(());
        }

        let failing = self.failing();
        let passed = self.units.len() - failing.len();
        let all_mismatched = failing
            .iter()
            .all(|u| u.outcome == UnitOutcome::Mismatched && u.conflict.is_none());

        if passed == 0 && all_mismatched {
            return Err(Error::VerificationMismatch {
                job: self.job.clone(),
                marker: self.marker.clone(),
                failed: failing.len(),
                total: self.units.len(),
            });
        }

        let failing = failing
            .iter()
            .map(|u| match &u.conflict {
                Some(device) => format!("{} (conflict on {device})", u.unit),
                None => format!("{} ({})", u.unit, u.outcome),
            })
            .collect();

        if passed == 0 {
            return Err(Error::VerificationFailed {
                job: self.job.clone(),
                total: self.units.len(),
                failing,
            });
        }

        Err(Error::PartialParallelFailure {
            job: self.job.clone(),
            passed,
            total: self.units.len(),
            failing,
        })
    }
}

/// Device identities mentioned in `output`, deduplicated in order of appearance.
#[must_use]
pub fn extract_devices(output: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    DEVICE_ID
        .find_iter(output)
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Mark units that share a device with a concurrently running unit.
fn find_conflicts(units: &mut [UnitResult]) -> Vec<DeviceConflict> {
    let mut conflicts = Vec::new();
    for i in 0..units.len() {
        for j in (i + 1)..units.len() {
            if !units[i].overlaps(&units[j]) {
                continue;
            }
            let shared = units[i]
                .devices
                .iter()
                .find(|d| units[j].devices.contains(d))
                .cloned();
            if let Some(device) = shared {
                warn!(
                    device = %device,
                    first = %units[i].unit,
                    second = %units[j].unit,
                    "Concurrent units share a device"
                );
                units[i].conflict.get_or_insert_with(|| device.clone());
                units[j].conflict.get_or_insert_with(|| device.clone());
                conflicts.push(DeviceConflict {
                    device,
                    units: (units[i].unit.clone(), units[j].unit.clone()),
                });
            }
        }
    }
    conflicts
}

fn excerpt(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(EXCERPT_LINES);
    lines[start..].join("\n")
}

/// Runs verification jobs against a cluster.
#[derive(Clone)]
pub struct VerificationRunner {
    cluster: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
}

impl VerificationRunner {
    /// Create a runner over a cluster client.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run when cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `job` once and report per-unit detail.
    ///
    /// All units are submitted before any is awaited. A failing verdict is
    /// reported in the result, not as an error; see
    /// [`VerificationResult::ensure_passed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the job is invalid.
    pub async fn verify(&self, job: &VerificationJob) -> Result<VerificationResult> {
        job.validate()?;

        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let specs = job.units(&run_id);
        info!(
            job = %job.name,
            run_id = %run_id,
            units = specs.len(),
            devices_per_unit = job.devices_per_unit,
            "Submitting verification units"
        );

        let mut submitted = Vec::new();
        let mut results = Vec::new();
        for unit in &specs {
            let mut result = UnitResult::new(unit);
            match self.cluster.submit(unit).await {
                Ok(()) => {
                    result.enter(UnitState::Submitted);
                    submitted.push((unit, result, Instant::now()));
                }
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "Failed to submit unit");
                    result.error = Some(e.to_string());
                    results.push(result);
                }
            }
        }

        let watched = join_all(
            submitted
                .into_iter()
                .map(|(unit, result, at)| self.watch(job, unit, result, at)),
        )
        .await;
        results.extend(watched);

        if job.keep_units {
            info!(job = %job.name, run_id = %run_id, "Keeping verification units");
        } else {
            for unit in &specs {
                if let Err(e) = self.cluster.cleanup(unit).await {
                    warn!(unit = %unit.name, error = %e, "Failed to clean up unit");
                }
            }
        }

        let aborted = self.cancel.is_cancelled();
        let result = VerificationResult::assemble(job, run_id, results, aborted);
        info!(
            job = %job.name,
            verdict = ?result.verdict,
            passed = result.units.iter().filter(|u| u.passed()).count(),
            total = result.units.len(),
            "Verification finished"
        );
        Ok(result)
    }

    /// Poll one unit until terminal, timed out or aborted.
    async fn watch(
        &self,
        job: &VerificationJob,
        unit: &UnitSpec,
        mut result: UnitResult,
        submitted: Instant,
    ) -> UnitResult {
        let deadline = submitted + job.unit_timeout();
        let mut api_errors = 0;
        // Latest moment the unit was known not to have started.
        let mut idle_since = result.submitted_at.unwrap_or_else(Utc::now);

        let status = loop {
            if Instant::now() >= deadline && !self.cancel.is_cancelled() {
                result.time_out(format!("no terminal state within {}s", job.unit_timeout_secs));
                warn!(unit = %unit.name, "Unit timed out");
                return result;
            }

            let polled = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                polled = tokio::time::timeout_at(deadline, self.cluster.status(unit)) => Some(polled),
            };

            match polled {
                None => {
                    warn!(unit = %unit.name, "Verification aborted");
                    result.time_out("aborted");
                    return result;
                }
                Some(Err(_)) => {
                    result.time_out(format!("no terminal state within {}s", job.unit_timeout_secs));
                    warn!(unit = %unit.name, "Unit timed out");
                    return result;
                }
                Some(Ok(Ok(status))) => {
                    api_errors = 0;
                    match status.phase {
                        UnitPhase::Pending => idle_since = Utc::now(),
                        UnitPhase::Running => {
                            if result.state() != Some(UnitState::Running) {
                                debug!(unit = %unit.name, "Unit running");
                                result.start(status.started_at.unwrap_or_else(Utc::now));
                            }
                        }
                        UnitPhase::Succeeded | UnitPhase::Failed => break status,
                    }
                }
                Some(Ok(Err(e))) => {
                    api_errors += 1;
                    warn!(unit = %unit.name, attempt = api_errors, error = %e, "Status poll failed");
                    if api_errors >= MAX_CONSECUTIVE_API_ERRORS {
                        result.abandon(
                            UnitState::Failed,
                            UnitOutcome::Failed,
                            format!("lost contact with cluster: {e}"),
                        );
                        return result;
                    }
                }
            }

            let next = (Instant::now() + job.poll_interval()).min(deadline);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep_until(next) => {}
            }
        };

        // A unit first seen terminal ran at some point after the last idle poll.
        result.start(idle_since);
        if let Some(started) = status.started_at {
            result.started_at = Some(started);
        }
        result.finished_at = Some(status.finished_at.unwrap_or_else(Utc::now));
        let phase = status.phase;

        let output = match self.cluster.logs(unit).await {
            Ok(output) => output,
            Err(e) => {
                result.enter(if phase == UnitPhase::Succeeded {
                    UnitState::Completed
                } else {
                    UnitState::Failed
                });
                result.outcome = UnitOutcome::Failed;
                result.error = Some(format!("could not fetch output: {e}"));
                return result;
            }
        };
        result.devices = extract_devices(&output);
        result.excerpt = excerpt(&output);

        if phase == UnitPhase::Failed {
            result.enter(UnitState::Failed);
            result.outcome = UnitOutcome::Failed;
            result.error = Some("unit exited unsuccessfully".into());
        } else if output.contains(&job.success_marker) {
            result.enter(UnitState::Completed);
            result.outcome = UnitOutcome::Matched;
        } else {
            result.enter(UnitState::Completed);
            result.outcome = UnitOutcome::Mismatched;
            result.error = Some(format!("output lacks '{}'", job.success_marker));
        }

        info!(
            unit = %unit.name,
            outcome = %result.outcome,
            devices = ?result.devices,
            "Unit finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPU_A: &str = "GPU-3c2b6f0e-5d1a-4f7e-9b2a-1e2d3c4b5a69";
    const GPU_B: &str = "GPU-8a7b6c5d-4e3f-2a1b-0c9d-8e7f6a5b4c3d";

    #[test]
    fn test_extract_devices() {
        let output = format!(
            "GPU 0: NVIDIA GeForce RTX 4090 (UUID: {GPU_A})\nGPU 1: NVIDIA GeForce RTX 4090 (UUID: {GPU_B})\n{GPU_A}\n"
        );
        assert_eq!(extract_devices(&output), vec![GPU_A.to_string(), GPU_B.to_string()]);
        assert!(extract_devices("Test PASSED").is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let mut job = VerificationJob::new("gpu-pair", 0, "cuda", "Test PASSED");
        assert!(job.validate().is_err());
        job.parallelism = 2;
        assert!(job.validate().is_ok());
        job.success_marker.clear();
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_unit_names() {
        let job = VerificationJob::new("gpu-pair", 2, "cuda", "Test PASSED");
        let units = job.units("abcd1234");
        assert_eq!(units[0].name, "gpu-pair-abcd1234-0");
        assert_eq!(units[1].index, 1);
        assert_eq!(units[1].devices, 1);
    }

    #[test]
    fn test_build_job_requests_devices() {
        let mut job = VerificationJob::new("gpu-pair", 1, "nvcr.io/cuda", "Test PASSED");
        job.devices_per_unit = 2;
        job.command = Some("nvidia-smi -L".into());
        job.runtime_class = Some("nvidia".into());
        let unit = &job.units("r1")[0];

        let manifest = build_job(unit).unwrap();
        let spec = manifest.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.runtime_class_name.as_deref(), Some("nvidia"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits[GPU_RESOURCE].0, "2");
        assert_eq!(container.command.as_ref().unwrap()[2], "nvidia-smi -L");
    }

    #[test]
    fn test_run_window_from_container_state() {
        let terminated: PodStatus = serde_json::from_value(json!({
            "phase": "Succeeded",
            "startTime": "2026-10-18T10:00:00Z",
            "containerStatuses": [{
                "name": CONTAINER,
                "image": "cuda",
                "imageID": "",
                "ready": false,
                "restartCount": 0,
                "state": { "terminated": {
                    "exitCode": 0,
                    "startedAt": "2026-10-18T10:00:30Z",
                    "finishedAt": "2026-10-18T10:00:42Z"
                }}
            }]
        }))
        .unwrap();
        let (started, finished) = run_window(&terminated);
        assert_eq!(started.unwrap().to_rfc3339(), "2026-10-18T10:00:30+00:00");
        assert_eq!(finished.unwrap().to_rfc3339(), "2026-10-18T10:00:42+00:00");

        let pending: PodStatus = serde_json::from_value(json!({ "phase": "Pending" })).unwrap();
        assert_eq!(run_window(&pending), (None, None));
    }

    #[test]
    fn test_job_phase_from_conditions() {
        let complete: JobStatus = serde_json::from_value(json!({
            "conditions": [{ "type": "Complete", "status": "True" }]
        }))
        .unwrap();
        assert_eq!(job_phase(&complete), Some(UnitPhase::Succeeded));

        let active: JobStatus = serde_json::from_value(json!({ "active": 1 })).unwrap();
        assert_eq!(job_phase(&active), None);
    }

    #[test]
    fn test_overlapping_windows() {
        let spec = VerificationJob::new("j", 2, "i", "m").units("r");
        let mut a = UnitResult::new(&spec[0]);
        let mut b = UnitResult::new(&spec[1]);
        let t0 = Utc::now();
        a.started_at = Some(t0);
        a.finished_at = Some(t0 + chrono::Duration::seconds(10));
        b.started_at = Some(t0 + chrono::Duration::seconds(20));
        b.finished_at = Some(t0 + chrono::Duration::seconds(30));
        assert!(!a.overlaps(&b));

        b.started_at = Some(t0 + chrono::Duration::seconds(5));
        assert!(a.overlaps(&b));
    }
}
