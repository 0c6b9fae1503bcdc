//! Test: Rerun - finished work is not repeated unless its parameters change

use crate::helpers::*;
use cryoflow::core::RecordSet;
use cryoflow::execution::SchedulingStrategy;
use cryoflow::metadata::{labels, JsonMetadataStore};
use cryoflow::protocols::DownsampleMicrographs;

#[tokio::test]
async fn test_second_run_executes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0).unwrap();

    let first = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();
    assert_run_completed(&first);
    let calls = mock.call_count();

    let second = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&second);
    assert_eq!(second.result.executed, 0);
    assert_eq!(second.result.satisfied_steps(), 5);
    assert!(all_satisfied(&second));
    assert_eq!(mock.call_count(), calls);
    assert_eq!(second.outputs["micrographs"].len(), 3);
}

#[tokio::test]
async fn test_deleted_output_reruns_only_its_step() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0).unwrap();

    run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();
    std::fs::remove_file(dir.path().join("m2.mrc")).unwrap();
    let calls = mock.call_count();

    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.call_count(), calls + 1);
    assert_step_state(&run, "downsample[m1]", "satisfied");
    assert_step_state(&run, "downsample[m2]", "completed");
    assert_step_state(&run, "downsample[m3]", "satisfied");
}

#[tokio::test]
async fn test_changed_factor_reruns_items() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let set = micrographs(dir.path(), &["m1", "m2"]);

    let ctx = downsample_context(dir.path(), set.clone(), 2.0).unwrap();
    run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();
    assert_eq!(mock.call_count(), 2);

    let ctx = downsample_context(dir.path(), set, 4.0).unwrap();
    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.call_count(), 4);
    assert_step_state(&run, "create_dirs", "satisfied");
    assert_step_state(&run, "downsample[m1]", "completed");
    assert_step_state(&run, "gather_results", "completed");
    assert!((run.outputs["micrographs"].sampling_rate().unwrap() - 5.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_added_micrograph_rewrites_combined_table() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);

    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2"]), 2.0).unwrap();
    run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0).unwrap();
    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.calls_to("xmipp_transform_downsample"), 3);
    assert_step_state(&run, "downsample[m1]", "satisfied");
    assert_step_state(&run, "downsample[m3]", "completed");
    assert_step_state(&run, "gather_results", "completed");

    let table = RecordSet::load(
        &JsonMetadataStore::new(),
        &dir.path().join("micrographs.xmd"),
        Some("micrographs"),
        labels::MICROGRAPH,
        None,
    )
    .unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(run.outputs["micrographs"].len(), 3);
}
