//! Test: Downsampling - one step per micrograph, then a combined table

use crate::helpers::*;
use cryoflow::core::RecordSet;
use cryoflow::execution::SchedulingStrategy;
use cryoflow::metadata::{labels, JsonMetadataStore, ACQUISITION_BLOCK};
use cryoflow::protocols::DownsampleMicrographs;

#[tokio::test]
async fn test_downsample_three_micrographs() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["m1", "m2", "m3"]), 2.0).unwrap();

    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.calls_to("xmipp_transform_downsample"), 3);
    // create_dirs, three items, gather_results
    assert_eq!(run.result.executed, 5);
    assert_step_state(&run, "downsample[m2]", "completed");
    assert_step_state(&run, "gather_results", "completed");

    let call = &mock.calls()[0];
    assert_eq!(call.value_of("--step"), Some("2.000000"));
    assert_eq!(call.value_of("--method"), Some("fourier"));

    let set = &run.outputs["micrographs"];
    assert_eq!(set.len(), 3);
    for (record, name) in set.iter().zip(["m1", "m2", "m3"]) {
        assert_eq!(record.location, dir.path().join(format!("{}.mrc", name)));
        assert!(record.location.exists());
    }
    assert!((set.sampling_rate().unwrap() - 2.8).abs() < 1e-9);

    let table = dir.path().join("micrographs.xmd");
    let written = RecordSet::load(
        &JsonMetadataStore::new(),
        &table,
        Some("micrographs"),
        labels::MICROGRAPH,
        Some(ACQUISITION_BLOCK),
    )
    .unwrap();
    assert_eq!(written.len(), 3);
    assert!((written.sampling_rate().unwrap() - 2.8).abs() < 1e-9);

    assert_eq!(run.summary[0], "Downsampling of micrographs from <micrographs> by a factor <2.00>");
}

#[tokio::test]
async fn test_items_finish_before_gather_starts() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(MockRunner::new(), SchedulingStrategy::Parallel);
    let events = record_events(&runner);
    let ctx = downsample_context(dir.path(), micrographs(dir.path(), &["a", "b", "c", "d"]), 3.0).unwrap();

    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();
    assert_run_completed(&run);

    let events = events.lock().unwrap().clone();
    let setup_done = event_index(&events, "create_dirs", false).unwrap();
    let gather_start = event_index(&events, "gather_results", true).unwrap();
    for name in ["a", "b", "c", "d"] {
        let step = format!("downsample[{}]", name);
        let start = event_index(&events, &step, true).unwrap();
        let done = event_index(&events, &step, false).unwrap();
        assert!(setup_done < start, "{} started before create_dirs finished", step);
        assert!(done < gather_start, "gather_results started before {} finished", step);
    }
}

#[tokio::test]
async fn test_empty_input_runs_only_setup() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let ctx = downsample_context(dir.path(), RecordSet::new(), 2.0).unwrap();

    let run = run_protocol(&runner, &DownsampleMicrographs, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(run.result.steps.len(), 1);
    assert_eq!(mock.call_count(), 0);
    assert!(run.outputs["micrographs"].is_empty());
    assert!(dir.path().join("extra").is_dir());
}

#[tokio::test]
async fn test_factor_below_one_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let err = downsample_context(dir.path(), micrographs(dir.path(), &["m1"]), 0.5).unwrap_err();

    assert!(err.is_configuration());
    assert!(err.to_string().contains("Downsampling must be larger than 1"));
    assert!(!dir.path().join("m1.mrc").exists());
}
