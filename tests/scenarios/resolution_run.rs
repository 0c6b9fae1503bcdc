//! Test: Resolution - optional analyses and their gathered tables

use crate::helpers::*;
use cryoflow::core::{InputSets, ParamValue, ParameterSet, RunPaths};
use cryoflow::execution::SchedulingStrategy;
use cryoflow::protocols::{ProtocolContext, Resolution3D};
use std::path::Path;

fn context(workdir: &Path, do_fsc: bool) -> cryoflow::Result<ProtocolContext> {
    let mut params = ParameterSet::new()
        .with("input_volume", ParamValue::Path("/data/map.vol".into()))
        .with("sampling_rate", ParamValue::Float(1.5))
        .with("do_fsc", ParamValue::Bool(do_fsc));
    if do_fsc {
        params.insert("reference_volume", ParamValue::Path("/data/ref.vol".into()));
    }
    ProtocolContext::for_protocol(&Resolution3D, "resolution", RunPaths::new(workdir), &params, InputSets::new())
}

#[tokio::test]
async fn test_fsc_and_structure_factor() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::LimitedParallel(2));

    let run = run_protocol(&runner, &Resolution3D, &context(dir.path(), true).unwrap())
        .await
        .unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.calls_to("xmipp_resolution_fsc"), 1);
    assert_eq!(mock.calls_to("xmipp_volume_structure_factor"), 1);

    let set = &run.outputs["resolution"];
    let locations: Vec<_> = set.iter().map(|r| r.location.clone()).collect();
    assert_eq!(
        locations,
        vec![dir.path().join("fsc.xmd"), dir.path().join("structureFactor.xmd")]
    );
    assert_eq!(set.sampling_rate(), Some(1.5));
}

#[tokio::test]
async fn test_structure_factor_only() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new();
    let runner = runner(mock.clone(), SchedulingStrategy::Sequential);

    let run = run_protocol(&runner, &Resolution3D, &context(dir.path(), false).unwrap())
        .await
        .unwrap();

    assert_run_completed(&run);
    assert_eq!(mock.calls_to("xmipp_resolution_fsc"), 0);
    assert_eq!(run.outputs["resolution"].len(), 1);
}

#[test]
fn test_fsc_without_reference_rejected() {
    let params = ParameterSet::new()
        .with("input_volume", ParamValue::Path("/data/map.vol".into()))
        .with("sampling_rate", ParamValue::Float(1.5));
    let err = ProtocolContext::for_protocol(&Resolution3D, "resolution", RunPaths::new("/w"), &params, InputSets::new())
        .unwrap_err();
    assert!(err.to_string().contains("Please provide a reference volume."));
}
