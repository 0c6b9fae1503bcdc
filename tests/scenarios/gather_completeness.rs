//! Test: Gather completeness - failed items drop out, or fail the gather

use crate::helpers::*;
use cryoflow::error::PipelineError;
use cryoflow::execution::SchedulingStrategy;
use cryoflow::gather::GatherMode;
use cryoflow::protocols::DownsampleMicrographs;
use cryoflow::RunStatus;

#[tokio::test]
async fn test_lenient_gather_skips_failed_item() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::failing_on(&["m2.tif"]);
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0).unwrap();

    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_eq!(run.result.status, RunStatus::Failed);
    assert_step_state(&run, "downsample[m1]", "completed");
    assert_step_state(&run, "downsample[m2]", "failed");
    assert_step_state(&run, "downsample[m3]", "completed");
    assert_step_state(&run, "gather_results", "aborted");
    assert_eq!(run.result.failures.len(), 1);

    let set = &run.outputs["micrographs"];
    let ids: Vec<u64> = set.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn test_strict_gather_reports_missing_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(MockRunner::failing_on(&["m2.tif"]), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0)
        .unwrap()
        .with_gather_mode(GatherMode::Strict);

    let err = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap_err();

    let failure = &err.step_failures()[0];
    assert_eq!(failure.step, "downsample[m2]");
    assert!(failure
        .command
        .as_deref()
        .is_some_and(|c| c.contains("xmipp_transform_downsample") && c.contains("m2.tif")));
    assert_eq!(failure.exit_code, Some(1));

    match err {
        PipelineError::GatherFailed { result, source } => {
            assert_eq!(result.status, RunStatus::Failed);
            assert_eq!(result.state_of("downsample[m1]").map(|s| s.label()), Some("completed"));
            match *source {
                PipelineError::IncompleteResults { expected, missing } => {
                    assert_eq!(expected, 3);
                    assert_eq!(missing, vec![dir.path().join("m2.mrc")]);
                }
                other => panic!("expected incomplete results, got {:?}", other),
            }
        }
        other => panic!("expected a failed gather, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_item_recovers_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let set = micrographs(dir.path(), &["m1", "m2"]);
    let ctx = downsample_context(dir.path(), set, 2.0).unwrap();

    let failing = runner(MockRunner::failing_on(&["m2.tif"]), SchedulingStrategy::Sequential);
    let run = run_protocol(&failing, &DownsampleMicrographs, &ctx).await.unwrap();
    assert_eq!(run.result.status, RunStatus::Failed);

    // Item outputs on disk are enough for a fresh run state
    let mock = MockRunner::new();
    let fixed = runner(mock.clone(), SchedulingStrategy::Sequential);
    let run = run_protocol(&fixed, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.calls_to("xmipp_transform_downsample"), 1);
    assert_step_state(&run, "downsample[m1]", "satisfied");
    assert_eq!(run.outputs["micrographs"].len(), 2);
}
