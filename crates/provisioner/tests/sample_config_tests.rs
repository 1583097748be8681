//! The shipped sample run file stays valid.

use std::path::PathBuf;

use provisioner::{RunConfig, StageGraph};

fn sample() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/single-node-gpu.yaml")
}

#[test]
fn test_sample_run_file_loads() {
    let config = RunConfig::load(&sample()).unwrap();
    let graph = StageGraph::build(config.stages.clone()).unwrap();

    let order: Vec<&str> = graph.install_order().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        order,
        vec!["os-prep", "nvidia-driver-check", "nvidia-toolkit", "k3s", "flux", "gpu-operator"]
    );

    let teardown: Vec<&str> = graph.teardown_order().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(teardown.first(), Some(&"gpu-operator"));
    assert_eq!(teardown.last(), Some(&"os-prep"));

    let job = config.job("gpu-pair").unwrap();
    assert_eq!(job.parallelism, 2);
    assert_eq!(job.success_marker, "Test PASSED");
    assert!(config.stages.iter().any(|s| s.artifacts.contains_key("kubeconfig")));
}
