//! Structure mapping of a set of volumes
//!
//! Every volume is converted to pseudoatoms and its normal modes computed;
//! every ordered pair of distinct volumes is aligned.

use crate::core::{
    CommandSpec, InputSets, ParamDecl, ParamValue, ParameterSet, Record, RecordSet, Step,
    StepContext, StepGraph, StepId, StepRole,
};
use crate::error::{PipelineError, Result};
use crate::metadata::{labels, MetadataStore, Value, WriteMode};
use crate::protocols::{Protocol, ProtocolContext};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NAME: &str = "structure_mapping";

const INPUT: &str = "input_volumes";
const PSEUDO_MASK: &str = "pseudo_mask";
const MASK_THRESHOLD: &str = "mask_threshold";
const MASK_FILE: &str = "mask_file";
const PSEUDOATOM_RADIUS: &str = "pseudoatom_radius";
const PSEUDOATOM_TARGET: &str = "pseudoatom_target";
const NUMBER_OF_MODES: &str = "number_of_modes";
const CUTOFF_MODE: &str = "cutoff_mode";
const RC_PERCENTAGE: &str = "rc_percentage";
const RC: &str = "rc";
const APPLY_MASK: &str = "apply_mask";
const ALIGN_MASK_TYPE: &str = "align_mask_type";
const ALIGN_MASK_RADIUS: &str = "align_mask_radius";
const ALIGN_MASK_FILE: &str = "align_mask_file";
const ALGORITHM: &str = "alignment_algorithm";

/// Search axes of the alignment, with default exhaustive range and local
/// step
const AXES: [(&str, &str, &str, f64); 7] = [
    ("rot", "--rot", "0 360 5", 1.0),
    ("tilt", "--tilt", "0 180 5", 1.0),
    ("psi", "--psi", "0 360 5", 1.0),
    ("shift_x", "-x", "0 0 1", 1.0),
    ("shift_y", "-y", "0 0 1", 1.0),
    ("shift_z", "-z", "0 0 1", 1.0),
    ("scale", "--scale", "1 1 0.005", 0.005),
];

/// Mask used when converting a volume to pseudoatoms
#[derive(Debug, Clone, PartialEq)]
enum PseudoMask {
    None,
    Threshold(f64),
    File(PathBuf),
}

/// Normal mode interaction cutoff
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cutoff {
    Relative(f64),
    Absolute(f64),
}

impl Cutoff {
    fn render(self) -> String {
        match self {
            Cutoff::Relative(p) => format!("Relative {:.6}", p),
            Cutoff::Absolute(rc) => format!("Absolute {:.6}", rc),
        }
    }
}

/// Mask applied while aligning two volumes
#[derive(Debug, Clone, PartialEq)]
enum AlignMask {
    None,
    Circular(i64),
    BinaryFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlignAlgorithm {
    FastFourier,
    Local,
    Exhaustive,
    ExhaustiveLocal,
}

impl AlignAlgorithm {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fast_fourier" => Some(AlignAlgorithm::FastFourier),
            "local" => Some(AlignAlgorithm::Local),
            "exhaustive" => Some(AlignAlgorithm::Exhaustive),
            "exhaustive_local" => Some(AlignAlgorithm::ExhaustiveLocal),
            _ => None,
        }
    }
}

/// Everything the steps need, read once from the parameters
#[derive(Debug, Clone)]
struct Settings {
    pseudo_mask: PseudoMask,
    radius: f64,
    target: f64,
    modes: i64,
    cutoff: Cutoff,
    align_mask: AlignMask,
    algorithm: AlignAlgorithm,
    search: Vec<[f64; 3]>,
    initial: Vec<f64>,
}

impl Settings {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let pseudo_mask = match params.get_text(PSEUDO_MASK)? {
            "none" => PseudoMask::None,
            "threshold" => PseudoMask::Threshold(params.get_float(MASK_THRESHOLD)?),
            "file" => PseudoMask::File(params.get_path(MASK_FILE)?.to_path_buf()),
            other => return Err(PipelineError::config(format!("unknown pseudoatom mask '{}'", other))),
        };

        let cutoff = match params.get_text(CUTOFF_MODE)? {
            "relative" => Cutoff::Relative(params.get_float(RC_PERCENTAGE)?),
            "absolute" => Cutoff::Absolute(params.get_float(RC)?),
            other => return Err(PipelineError::config(format!("unknown cutoff mode '{}'", other))),
        };

        let align_mask = if !params.get_bool(APPLY_MASK)? {
            AlignMask::None
        } else {
            match params.get_text(ALIGN_MASK_TYPE)? {
                "circular" => AlignMask::Circular(params.get_int(ALIGN_MASK_RADIUS)?),
                "binary_file" => AlignMask::BinaryFile(params.get_path(ALIGN_MASK_FILE)?.to_path_buf()),
                other => return Err(PipelineError::config(format!("unknown alignment mask '{}'", other))),
            }
        };

        let algorithm_name = params.get_text(ALGORITHM)?;
        let algorithm = AlignAlgorithm::parse(algorithm_name).ok_or_else(|| {
            PipelineError::config(format!("unknown alignment algorithm '{}'", algorithm_name))
        })?;

        let mut search = Vec::with_capacity(AXES.len());
        let mut initial = Vec::with_capacity(AXES.len());
        for (axis, _, _, _) in AXES {
            search.push(parse_range(params.get_text(&format!("search_{}", axis))?, axis)?);
            initial.push(params.get_float(&format!("initial_{}", axis))?);
        }

        Ok(Self {
            pseudo_mask,
            radius: params.get_float(PSEUDOATOM_RADIUS)?,
            target: params.get_float(PSEUDOATOM_TARGET)?,
            modes: params.get_int(NUMBER_OF_MODES)?,
            cutoff,
            align_mask,
            algorithm,
            search,
            initial,
        })
    }

    fn mask_args(&self, cmd: CommandSpec) -> CommandSpec {
        match &self.align_mask {
            AlignMask::None => cmd,
            AlignMask::Circular(radius) => cmd.args("--mask", ["circular".to_string(), format!("-{}", radius)]),
            AlignMask::BinaryFile(path) => {
                cmd.args("--mask", ["binary_file".to_string(), path.display().to_string()])
            }
        }
    }

    fn align_args(&self, mut cmd: CommandSpec) -> CommandSpec {
        match self.algorithm {
            AlignAlgorithm::FastFourier => cmd.switch("--frm"),
            AlignAlgorithm::Local => {
                cmd = cmd.switch("--local");
                for (i, (_, flag, _, step)) in AXES.iter().enumerate() {
                    let v = self.initial[i];
                    cmd = cmd.args(flag, [v, v, *step].map(|x| format!("{:.6}", x)));
                }
                cmd
            }
            AlignAlgorithm::Exhaustive | AlignAlgorithm::ExhaustiveLocal => {
                for (i, (_, flag, _, _)) in AXES.iter().enumerate() {
                    cmd = cmd.args(flag, self.search[i].map(|x| format!("{:.6}", x)));
                }
                cmd
            }
        }
    }
}

/// `"min max step"` as three numbers
fn parse_range(text: &str, axis: &str) -> Result<[f64; 3]> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| PipelineError::config(format!("search range for {} is not numeric: '{}'", axis, text)))?;
    match values.as_slice() {
        [min, max, step] => Ok([*min, *max, *step]),
        _ => Err(PipelineError::config(format!(
            "search range for {} needs min, max and step: '{}'",
            axis, text
        ))),
    }
}

fn sampling_rate(volume: &Record, set: &RecordSet) -> Result<f64> {
    volume
        .attr(labels::SAMPLING_RATE)
        .and_then(Value::as_f64)
        .or_else(|| set.sampling_rate())
        .ok_or_else(|| {
            PipelineError::config(format!("volume {} has no sampling rate", volume.location.display()))
        })
}

/// Elastic alignment and normal mode analysis over a set of volumes
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureMapping;

impl StructureMapping {
    /// Mask, pseudoatoms, modes and mode table reformat for one volume
    fn add_volume_steps(
        builder: &mut crate::core::GraphBuilder,
        ctx: &ProtocolContext,
        settings: &Settings,
        volume: &Record,
        ts: f64,
        setup: StepId,
    ) -> Result<StepId> {
        let id = volume.id;
        let mut parent = setup;

        let mask = match &settings.pseudo_mask {
            PseudoMask::None => None,
            PseudoMask::File(path) => Some(path.clone()),
            PseudoMask::Threshold(threshold) => {
                let mask = ctx.paths.extra_path(format!("mask_{}.vol", id));
                let cmd = ctx
                    .command("xmipp_transform_threshold")?
                    .arg_path("-i", &volume.location)
                    .arg_path("-o", &mask)
                    .args("--select", ["below".to_string(), format!("{:.6}", threshold)])
                    .arg("--substitute", "binarize");
                parent = builder.add_step(
                    Step::command(format!("threshold_mask[{}]", id), cmd)
                        .input(&volume.location)
                        .verify(&mask)
                        .after(setup)
                        .parallel()
                        .role(StepRole::Item),
                );
                Some(mask)
            }
        };

        let pseudo_root = ctx.paths.path(format!("pseudoatoms_{}", id));
        let pdb = ctx.paths.path(format!("pseudoatoms_{}.pdb", id));
        let mut cmd = ctx
            .command("xmipp_volume_to_pseudoatoms")?
            .arg_path("-i", &volume.location)
            .arg_path("-o", &pseudo_root)
            .arg_f64("--sigma", ts * settings.radius)
            .arg_f64("--targetError", settings.target)
            .arg_f64("--sampling_rate", ts)
            .arg("-v", 2)
            .arg("--intensityColumn", "Bfactor");
        if let Some(mask) = &mask {
            cmd = cmd.args("--mask", ["binary_file".to_string(), mask.display().to_string()]);
        }
        let pseudoatoms = builder.add_step(
            Step::command(format!("pseudoatoms[{}]", id), cmd)
                .input(&volume.location)
                .verify(&pdb)
                .after(parent)
                .parallel()
                .role(StepRole::Item),
        );

        let modes_dir = ctx.paths.path(format!("modes_{}", id));
        let cmd = ctx
            .command("xmipp_nma_modes")?
            .arg_path("--pdb", &pdb)
            .arg_path("--odir", &modes_dir)
            .arg("--modes", settings.modes)
            .arg("--cutoff", settings.cutoff.render());
        let modes = builder.add_step(
            Step::command(format!("compute_modes[{}]", id), cmd)
                .input(&pdb)
                .verify(modes_dir.join("modes.xmd"))
                .after(pseudoatoms)
                .parallel()
                .role(StepRole::Item),
        );

        let store = ctx.store.clone();
        let table = ctx.paths.path(format!("modes_{}.xmd", id));
        let output = table.clone();
        let reformat = Step::function(format!("reformat_modes[{}]", id), "reformat_modes", move |_: &StepContext| {
            reformat_modes(store.as_ref(), &modes_dir, &output)
        })
        .fingerprint_with(table.display())
        .verify(&table)
        .after(modes)
        .parallel()
        .role(StepRole::Item);

        Ok(builder.add_step(reformat))
    }
}

impl Protocol for StructureMapping {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> Vec<ParamDecl> {
        let text = |name: &str, value: &str| ParamDecl::text(name).default(ParamValue::Text(value.into()));
        let float = |name: &str, value: f64| ParamDecl::float(name).default(ParamValue::Float(value));

        let mut decls = vec![
            ParamDecl::reference(INPUT).required(),
            text(PSEUDO_MASK, "none"),
            float(MASK_THRESHOLD, 0.01),
            ParamDecl::path(MASK_FILE).required().when(PSEUDO_MASK, ParamValue::Text("file".into())),
            float(PSEUDOATOM_RADIUS, 2.0),
            float(PSEUDOATOM_TARGET, 2.0),
            ParamDecl::int(NUMBER_OF_MODES).default(ParamValue::Int(20)),
            text(CUTOFF_MODE, "relative"),
            float(RC_PERCENTAGE, 95.0),
            float(RC, 8.0),
            ParamDecl::bool(APPLY_MASK).default(ParamValue::Bool(false)),
            text(ALIGN_MASK_TYPE, "circular"),
            ParamDecl::int(ALIGN_MASK_RADIUS).default(ParamValue::Int(-1)),
            ParamDecl::path(ALIGN_MASK_FILE)
                .required()
                .when(ALIGN_MASK_TYPE, ParamValue::Text("binary_file".into())),
            text(ALGORITHM, "fast_fourier"),
        ];
        for (axis, _, range, _) in AXES {
            let start = if axis == "scale" { 1.0 } else { 0.0 };
            decls.push(text(&format!("search_{}", axis), range));
            decls.push(float(&format!("initial_{}", axis), start));
        }
        decls
    }

    fn validate(&self, params: &ParameterSet, inputs: &InputSets) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = inputs.resolve(params, INPUT) {
            errors.push(format!("Invalid input: {}", e));
        }
        if let Err(e) = Settings::from_params(params) {
            errors.push(e.to_string());
        }
        if params.get_int(NUMBER_OF_MODES).map(|n| n < 1).unwrap_or(false) {
            errors.push("At least one normal mode is needed".to_string());
        }
        errors
    }

    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph> {
        let volumes = ctx.inputs.resolve(&ctx.params, INPUT)?;
        let settings = Settings::from_params(&ctx.params)?;
        let mut builder = ctx.graph_builder();
        let setup = builder.add_step(ctx.setup_step());

        for volume in volumes.iter() {
            let ts = sampling_rate(volume, volumes)?;
            Self::add_volume_steps(&mut builder, ctx, &settings, volume, ts, setup)?;
        }

        let mut pairs = 0;
        for reference in volumes.iter() {
            for volume in volumes.iter().filter(|v| v.id != reference.id) {
                let output = ctx
                    .paths
                    .extra_path(format!("output_vol{:06}_{:06}.vol", reference.id, volume.id));
                let cmd = ctx
                    .command("xmipp_volume_align")?
                    .arg_path("--i1", &reference.location)
                    .arg_path("--i2", &volume.location)
                    .arg_path("--apply", &output);
                let cmd = settings.align_args(settings.mask_args(cmd));

                builder.add_step(
                    Step::command(format!("align[{}->{}]", reference.id, volume.id), cmd)
                        .input(&reference.location)
                        .input(&volume.location)
                        .verify(&output)
                        .after(setup)
                        .parallel()
                        .role(StepRole::Item),
                );
                pairs += 1;
            }
        }

        info!("Structure mapping over {} volumes, {} alignments", volumes.len(), pairs);
        builder.build()
    }
}

/// Rewrite the mode table so mode files are addressed from the run root
fn reformat_modes(store: &dyn MetadataStore, modes_dir: &Path, output: &Path) -> Result<()> {
    let source = modes_dir.join("modes.xmd");
    let mut table = store.open(&source, None)?;

    let rows: Vec<_> = table.iter().collect();
    for row in rows {
        let file = table.require(labels::NMA_MODEFILE, row, &source)?.to_string();
        let file = PathBuf::from(file);
        if file.is_relative() {
            table.set(labels::NMA_MODEFILE, row, modes_dir.join(&file).as_path());
        }
        if table.get(labels::ENABLED, row).is_none() {
            table.set(labels::ENABLED, row, Value::Int(1));
        }
        if table.get(labels::ORDER, row).is_none() {
            table.set(labels::ORDER, row, Value::Int(row as i64));
        }
    }

    debug!("Reformatted {} modes into {}", table.len(), output.display());
    store.write(&table, output, None, WriteMode::Overwrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunPaths;
    use crate::metadata::{JsonMetadataStore, Table};
    use std::collections::BTreeMap;

    fn volumes(n: u64) -> RecordSet {
        let mut set = RecordSet::from_records(
            (1..=n).map(|i| Record::new(i, format!("/data/vol{}.vol", i))).collect(),
        )
        .unwrap();
        set.set_shared(labels::SAMPLING_RATE, 2.0);
        set
    }

    fn context(set: RecordSet, extra: &[(&str, ParamValue)]) -> Result<ProtocolContext> {
        let mut params = ParameterSet::new().with(INPUT, ParamValue::Reference("volumes".into()));
        for (name, value) in extra {
            params.insert(*name, value.clone());
        }
        ProtocolContext::for_protocol(
            &StructureMapping,
            "mapping",
            RunPaths::new("/work/sm"),
            &params,
            InputSets::new().with("volumes", set),
        )
    }

    #[test]
    fn test_all_pairs_without_self_alignment() {
        let ctx = context(volumes(3), &[]).unwrap();
        let graph = StructureMapping.build_graph(&ctx).unwrap();

        let aligns: Vec<_> = graph.steps().iter().filter(|s| s.name.starts_with("align[")).collect();
        assert_eq!(aligns.len(), 6);
        for step in &aligns {
            let cmd = step.action.command().unwrap();
            assert_ne!(cmd.value_of("--i1"), cmd.value_of("--i2"));
        }
        assert_eq!(graph.steps().iter().filter(|s| s.name.starts_with("pseudoatoms[")).count(), 3);
        assert_eq!(graph.steps().iter().filter(|s| s.name.starts_with("compute_modes[")).count(), 3);
        assert!(graph.step_by_name("align[2->2]").is_none());
    }

    #[test]
    fn test_single_volume_has_no_alignments() {
        let ctx = context(volumes(1), &[]).unwrap();
        let graph = StructureMapping.build_graph(&ctx).unwrap();
        assert!(graph.steps().iter().all(|s| !s.name.starts_with("align[")));
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_pseudoatom_and_mode_commands() {
        let ctx = context(
            volumes(2),
            &[
                (PSEUDO_MASK, ParamValue::Text("threshold".into())),
                (CUTOFF_MODE, ParamValue::Text("absolute".into())),
            ],
        )
        .unwrap();
        let graph = StructureMapping.build_graph(&ctx).unwrap();

        let mask = graph.step_by_name("threshold_mask[1]").unwrap();
        let pseudo = graph.step_by_name("pseudoatoms[1]").unwrap();
        assert_eq!(pseudo.parents, vec![mask.id]);
        let cmd = pseudo.action.command().unwrap();
        assert_eq!(cmd.value_of("--sigma"), Some("4.000000"));
        assert_eq!(cmd.value_of("--sampling_rate"), Some("2.000000"));
        assert!(cmd.argument_string().contains("--mask binary_file /work/sm/extra/mask_1.vol"));

        let modes = graph.step_by_name("compute_modes[1]").unwrap().action.command().unwrap();
        assert_eq!(modes.value_of("--cutoff"), Some("Absolute 8.000000"));
        assert_eq!(modes.value_of("--modes"), Some("20"));
    }

    #[test]
    fn test_align_arguments() {
        let ctx = context(
            volumes(2),
            &[
                (APPLY_MASK, ParamValue::Bool(true)),
                (ALIGN_MASK_RADIUS, ParamValue::Int(30)),
                (ALGORITHM, ParamValue::Text("local".into())),
            ],
        )
        .unwrap();
        let graph = StructureMapping.build_graph(&ctx).unwrap();
        let cmd = graph.step_by_name("align[1->2]").unwrap().action.command().unwrap();
        let args = cmd.argument_string();
        assert!(args.starts_with(
            "--i1 /data/vol1.vol --i2 /data/vol2.vol --apply /work/sm/extra/output_vol000001_000002.vol --mask circular -30 --local"
        ));
        assert!(args.contains("--rot 0.000000 0.000000 1.000000"));
        assert!(args.ends_with("--scale 1.000000 1.000000 0.005000"));

        let ctx = context(volumes(2), &[(ALGORITHM, ParamValue::Text("exhaustive".into()))]).unwrap();
        let graph = StructureMapping.build_graph(&ctx).unwrap();
        let cmd = graph.step_by_name("align[2->1]").unwrap().action.command().unwrap();
        assert!(cmd.argument_string().contains("--tilt 0.000000 180.000000 5.000000"));
        assert!(!cmd.argument_string().contains("--mask"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let err = context(volumes(2), &[(ALGORITHM, ParamValue::Text("simplex".into()))])
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown alignment algorithm 'simplex'"));

        let err = context(volumes(2), &[("search_rot", ParamValue::Text("0 360".into()))])
            .err()
            .unwrap();
        assert!(err.to_string().contains("needs min, max and step"));
    }

    #[test]
    fn test_missing_sampling_rate() {
        let set = RecordSet::from_records(vec![Record::new(1, "/data/v.vol")]).unwrap();
        let ctx = context(set, &[]).unwrap();
        let err = StructureMapping.build_graph(&ctx).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_reformat_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMetadataStore::new();
        let modes_dir = dir.path().join("modes_1");

        let mut table = Table::new();
        for name in ["vec.7", "vec.8"] {
            let mut row = BTreeMap::new();
            row.insert(labels::NMA_MODEFILE.to_string(), Value::from(name));
            table.append_row(row);
        }
        store
            .write(&table, &modes_dir.join("modes.xmd"), None, WriteMode::Overwrite)
            .unwrap();

        let output = dir.path().join("modes_1.xmd");
        reformat_modes(&store, &modes_dir, &output).unwrap();

        let reformatted = store.open(&output, None).unwrap();
        assert_eq!(
            reformatted.get(labels::NMA_MODEFILE, 2).unwrap().to_string(),
            modes_dir.join("vec.8").display().to_string()
        );
        assert_eq!(reformatted.get(labels::ENABLED, 1), Some(&Value::Int(1)));
        assert_eq!(reformatted.get(labels::ORDER, 2), Some(&Value::Int(2)));
    }
}
