//! Test: Launch - a run configuration driving real subprocesses

use crate::helpers::*;
#[cfg(all(unix, feature = "sqlite"))]
use std::path::{Path, PathBuf};
use cryoflow::metadata::{labels, JsonMetadataStore, ACQUISITION_BLOCK};
use cryoflow::{launch, RunConfig, RunStatus};

#[tokio::test]
async fn test_launch_unknown_protocol_lists_known_ones() {
    let config = RunConfig::from_yaml("protocol: ctf_estimation\nworkdir: /tmp/unused\n").unwrap();
    let err = launch(&config).await.unwrap_err();

    assert!(err.is_configuration());
    assert!(err.to_string().contains("downsample_micrographs"));
}

/// Shell stand-in for the downsampling program: creates whatever -o names
#[cfg(all(unix, feature = "sqlite"))]
fn script_tool(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let tool = dir.join("fake_downsample.sh");
    std::fs::write(
        &tool,
        "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then touch \"$2\"; fi\n  shift\ndone\n",
    )
    .unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    tool
}

/// Downsampling configuration over two micrographs, with extra runner lines
#[cfg(all(unix, feature = "sqlite"))]
fn downsample_config(dir: &Path, workdir: &Path, runner_extra: &str) -> RunConfig {
    let input = dir.join("input.xmd");
    micrographs(dir, &["m1", "m2"])
        .save(
            &JsonMetadataStore::new(),
            &input,
            Some("micrographs"),
            labels::MICROGRAPH,
            ACQUISITION_BLOCK,
        )
        .unwrap();

    let yaml = format!(
        r#"
protocol: downsample_micrographs
workdir: {workdir}
run_name: launch_test
params:
  input_micrographs: {{ ref: micrographs }}
  downsample_factor: 2.0
inputs:
  micrographs:
    metadata: {input}
    block: micrographs
    location: {location}
    shared_block: {shared}
runner:
  strategy: parallel
  max_workers: 2
  tools:
    xmipp_transform_downsample: {tool}
{runner_extra}"#,
        workdir = workdir.display(),
        input = input.display(),
        location = labels::MICROGRAPH,
        shared = ACQUISITION_BLOCK,
        tool = script_tool(dir).display(),
        runner_extra = runner_extra,
    );
    RunConfig::from_yaml(&yaml).unwrap()
}

#[cfg(all(unix, feature = "sqlite"))]
#[tokio::test]
async fn test_launch_downsample_with_script_tool() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("run");
    let db = dir.path().join("state.db");
    let config = downsample_config(dir.path(), &workdir, &format!("  state_db: {}\n", db.display()));

    let run = launch(&config).await.unwrap();
    assert_eq!(run.result.status, RunStatus::Completed, "{:?}", run.result.failures);
    assert!(workdir.join("m1.mrc").exists());
    assert!(workdir.join("m2.mrc").exists());
    assert!(workdir.join("micrographs.xmd").exists());
    assert_eq!(run.outputs["micrographs"].len(), 2);
    assert!(db.exists());

    // Run state persisted in the database carries over to a new launch
    let rerun = launch(&config).await.unwrap();
    assert_eq!(rerun.result.status, RunStatus::Completed);
    assert_eq!(rerun.result.executed, 0);
}

#[cfg(all(unix, feature = "sqlite"))]
#[tokio::test]
async fn test_launch_keeps_run_state_in_workdir_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("run");
    let config = downsample_config(dir.path(), &workdir, "");
    assert!(config.runner.state_db.is_none());

    let run = launch(&config).await.unwrap();
    assert_eq!(run.result.status, RunStatus::Completed, "{:?}", run.result.failures);
    assert!(workdir.join("run_state.db").exists());

    // Deleting an output is noticed through the verify files
    std::fs::remove_file(workdir.join("m2.mrc")).unwrap();
    let rerun = launch(&config).await.unwrap();
    assert_eq!(rerun.result.status, RunStatus::Completed);
    assert_eq!(rerun.result.state_of("downsample[m1]").map(|s| s.label()), Some("satisfied"));
    assert_eq!(rerun.result.state_of("downsample[m2]").map(|s| s.label()), Some("completed"));

    let again = launch(&config).await.unwrap();
    assert_eq!(again.result.executed, 0);
}
