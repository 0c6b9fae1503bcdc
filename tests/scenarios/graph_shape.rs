//! Test: Graph shape - step sets built from protocol inputs

use crate::helpers::*;
use cryoflow::core::{InputSets, ParamValue, ParameterSet, RunPaths, StepRole};
use cryoflow::protocols::{Protocol, ProtocolContext, RandomConicalTilt, StructureMapping};
use std::collections::HashSet;

fn mapping_context(n: u64) -> ProtocolContext {
    let params = ParameterSet::new()
        .with("input_volumes", ParamValue::Reference("volumes".into()))
        .with("alignment_algorithm", ParamValue::Text("local".into()));
    ProtocolContext::for_protocol(
        &StructureMapping,
        "mapping",
        RunPaths::new("/work/sm"),
        &params,
        InputSets::new().with("volumes", volumes(n)),
    )
    .unwrap()
}

#[test]
fn test_structure_mapping_aligns_every_ordered_pair() {
    let graph = StructureMapping.build_graph(&mapping_context(4)).unwrap();

    let aligns: Vec<&str> = graph
        .steps()
        .iter()
        .map(|s| s.name.as_str())
        .filter(|n| n.starts_with("align["))
        .collect();
    assert_eq!(aligns.len(), 12);

    let unique: HashSet<&str> = aligns.iter().copied().collect();
    assert_eq!(unique.len(), 12);
    for i in 1..=4 {
        assert!(!unique.contains(format!("align[{}->{}]", i, i).as_str()));
    }
    assert!(unique.contains("align[1->4]"));
    assert!(unique.contains("align[4->1]"));
}

#[test]
fn test_structure_mapping_alignment_follows_modes() {
    let graph = StructureMapping.build_graph(&mapping_context(2)).unwrap();
    let order = graph.ordered_names();
    let position = |name: &str| order.iter().position(|n| *n == name).unwrap();

    assert!(position("reformat_modes[1]") < position("align[1->2]"));
    assert!(position("reformat_modes[2]") < position("align[1->2]"));

    let align = graph.step_by_name("align[2->1]").unwrap().action.command().unwrap();
    assert_eq!(align.value_of("--i1"), Some("/data/vol2.vol"));
    assert_eq!(align.value_of("--i2"), Some("/data/vol1.vol"));
    assert!(align.argv().contains(&"--local".to_string()));
}

#[test]
fn test_rct_reconstructs_each_selected_class() {
    let dir = tempfile::tempdir().unwrap();
    let ml2d = dir.path().join("ml2d");
    std::fs::create_dir_all(&ml2d).unwrap();
    for iteration in ["it000001", "it000002", "it000003"] {
        std::fs::write(ml2d.join(format!("classes_{}.doc", iteration)), b"").unwrap();
        std::fs::write(ml2d.join(format!("classes_{}.log", iteration)), "xmipp_ml_align2d -nref 8\n").unwrap();
    }

    let params = ParameterSet::new()
        .with("untilted_images", ParamValue::Reference("untilted".into()))
        .with("tilted_images", ParamValue::Reference("tilted".into()))
        .with("ml2d_dir", ParamValue::Path(ml2d.clone()))
        .with("ml2d_root", ParamValue::Text("classes".into()))
        .with("select_classes", ParamValue::Text("2, 5-6".into()))
        .with("do_low_pass", ParamValue::Bool(false));
    let ctx = ProtocolContext::for_protocol(
        &RandomConicalTilt,
        "rct",
        RunPaths::new(dir.path().join("rct")),
        &params,
        InputSets::new()
            .with("untilted", volumes(3))
            .with("tilted", volumes(3)),
    )
    .unwrap();

    let graph = RandomConicalTilt.build_graph(&ctx).unwrap();

    for class in [2, 5, 6] {
        assert!(graph.step_by_name(&format!("reconstruct[{}]", class)).is_some());
        let prepare = graph.step_by_name(&format!("prepare_class[{}]", class)).unwrap();
        assert!(prepare
            .inputs
            .contains(&ml2d.join(format!("classes_it000003_ref{:06}.xmp", class))));
    }
    assert!(graph.step_by_name("reconstruct[3]").is_none());
    assert!(graph.steps_with_role(StepRole::Finalize).is_empty());

    let select = graph.step_by_name("select_angles[5]").unwrap().action.command().unwrap();
    assert_eq!(
        select.value_of("-i"),
        Some(ml2d.join("classes_it000003.doc").to_str().unwrap())
    );
}
