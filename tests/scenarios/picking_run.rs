//! Test: Picking - imported coordinates become training annotations

use crate::helpers::*;
use cryoflow::core::{InputSets, ParamValue, ParameterSet, RunPaths};
use cryoflow::execution::SchedulingStrategy;
use cryoflow::metadata::{labels, JsonMetadataStore, MetadataStore, Table, Value, WriteMode};
use cryoflow::protocols::{CryoloPicking, ProtocolContext};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_imported_coordinates_without_external_tools() {
    let dir = tempfile::tempdir().unwrap();
    let coords = dir.path().join("coords");
    let store = JsonMetadataStore::new();
    for (stem, n) in [("m1", 2), ("m2", 1)] {
        let mut table = Table::new();
        for i in 0..n {
            let mut row = BTreeMap::new();
            row.insert(labels::X.to_string(), Value::Int(10 * (i + 1)));
            row.insert(labels::Y.to_string(), Value::Int(20 * (i + 1)));
            table.append_row(row);
        }
        store
            .write(&table, &coords.join(format!("{}.pos", stem)), None, WriteMode::Overwrite)
            .unwrap();
    }

    let workdir = dir.path().join("run");
    let params = ParameterSet::new()
        .with("input_micrographs", ParamValue::Reference("micrographs".into()))
        .with("import_folder", ParamValue::Path(coords.clone()))
        .with("box_size", ParamValue::Int(64));
    let ctx = ProtocolContext::for_protocol(
        &CryoloPicking,
        "picking",
        RunPaths::new(&workdir),
        &params,
        InputSets::new().with("micrographs", micrographs(dir.path(), &["m1", "m2", "m3"])),
    )
    .unwrap();

    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let run = run_protocol(&runner, &CryoloPicking, &ctx).await.unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.call_count(), 0);

    let annotations = workdir.join("extra").join("train_annotation");
    let m1 = std::fs::read_to_string(annotations.join("m1.box")).unwrap();
    assert_eq!(m1, "10\t20\t64\t64\n20\t40\t64\t64\n");
    assert!(!annotations.join("m3.box").exists());
    assert!(workdir.join("extra").join("config_generalized_model.json").exists());
    assert_eq!(run.summary, vec!["2 of 3 micrographs have training annotations"]);
}

#[tokio::test]
async fn test_interactive_picker_opens_once() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("run");
    let params = ParameterSet::new()
        .with("input_micrographs", ParamValue::Reference("micrographs".into()));
    let ctx = ProtocolContext::for_protocol(
        &CryoloPicking,
        "picking",
        RunPaths::new(&workdir),
        &params,
        InputSets::new().with("micrographs", micrographs(dir.path(), &["m1", "m2"])),
    )
    .unwrap();

    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);
    let run = run_protocol(&runner, &CryoloPicking, &ctx).await.unwrap();
    assert_run_completed(&run);
    assert_step_state(&run, "pick_particles", "completed");
    assert_eq!(mock.calls_to("xmipp_micrograph_particle_picking"), 1);
    assert!(mock.calls()[0].interactive);

    // The recorded run state stands in for the picker's missing outputs
    let rerun = run_protocol(&runner, &CryoloPicking, &ctx).await.unwrap();
    assert_eq!(rerun.result.executed, 0);
    assert_step_state(&rerun, "pick_particles", "satisfied");
    assert_eq!(mock.calls_to("xmipp_micrograph_particle_picking"), 1);
}
