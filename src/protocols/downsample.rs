//! Micrograph downsampling
//!
//! One parallel `xmipp_transform_downsample` step per micrograph, then a
//! gather step that rewrites the micrograph tables of the import run to point
//! at the downsampled files and scales their sampling rate.

use crate::core::paths::item_output_path;
use crate::core::{
    InputSets, ParamDecl, ParamValue, ParameterSet, RecordSet, RunResult, Step, StepContext,
    StepGraph, StepRole,
};
use crate::error::Result;
use crate::gather::{ItemOutput, ResultGatherer, SharedAdjustment};
use crate::metadata::{labels, MetadataStore};
use crate::protocols::{Protocol, ProtocolContext, ProtocolOutputs};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NAME: &str = "downsample_micrographs";

const INPUT: &str = "input_micrographs";
const FACTOR: &str = "downsample_factor";
const IMPORT_DIR: &str = "import_dir";

/// Downsamples every micrograph of a set by a Fourier-space factor
#[derive(Debug, Clone, Copy, Default)]
pub struct DownsampleMicrographs;

impl DownsampleMicrographs {
    fn outputs(ctx: &ProtocolContext, input: &RecordSet) -> Vec<ItemOutput> {
        input
            .iter()
            .map(|r| ItemOutput::new(r.id, item_output_path(ctx.paths.root(), &r.location, "mrc")))
            .collect()
    }
}

impl Protocol for DownsampleMicrographs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> Vec<ParamDecl> {
        vec![
            ParamDecl::reference(INPUT).required(),
            ParamDecl::float(FACTOR).default(ParamValue::Float(2.0)),
            ParamDecl::path(IMPORT_DIR),
        ]
    }

    fn validate(&self, params: &ParameterSet, _inputs: &InputSets) -> Vec<String> {
        let mut errors = Vec::new();
        if params.get_float(FACTOR).map(|f| f <= 1.0).unwrap_or(true) {
            errors.push("Downsampling must be larger than 1".to_string());
        }
        errors
    }

    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph> {
        let input = ctx.inputs.resolve(&ctx.params, INPUT)?;
        let factor = ctx.params.get_float(FACTOR)?;
        let mut builder = ctx.graph_builder();
        let setup = builder.add_step(ctx.setup_step());

        if input.is_empty() {
            info!("No micrographs to downsample");
            return builder.build();
        }

        let mut io_map = HashMap::new();
        let mut items = Vec::with_capacity(input.len());
        for (record, output) in input.iter().zip(Self::outputs(ctx, input)) {
            let cmd = ctx
                .command("xmipp_transform_downsample")?
                .arg_path("-i", &record.location)
                .arg_path("-o", &output.path)
                .arg_f64("--step", factor)
                .arg("--method", "fourier");

            io_map.insert(record.location.display().to_string(), output.path.clone());
            items.push(
                builder.add_step(
                    Step::command(format!("downsample[{}]", record.stem()), cmd)
                        .input(&record.location)
                        .verify(&output.path)
                        .after(setup)
                        .parallel()
                        .role(StepRole::Item),
                ),
            );
        }

        let fingerprint = format!(
            "factor={} inputs={}",
            factor,
            input
                .iter()
                .map(|r| r.location.display().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let store = ctx.store.clone();
        let import_dir = ctx.params.get_path(IMPORT_DIR).ok().map(Path::to_path_buf);
        let input = input.clone();
        let gather = Step::function("gather_results", "gather_results", move |step_ctx: &StepContext| {
            gather_results(store.as_ref(), step_ctx, import_dir.as_deref(), &io_map, &input, factor)
        })
        .fingerprint_with(fingerprint)
        .verify(ctx.paths.path("micrographs.xmd"))
        .after_all(items)
        .role(StepRole::Gather);
        builder.add_step(gather);

        builder.build()
    }

    fn gather(&self, ctx: &ProtocolContext, _result: &RunResult) -> Result<ProtocolOutputs> {
        let input = ctx.inputs.resolve(&ctx.params, INPUT)?;
        let factor = ctx.params.get_float(FACTOR)?;

        let set = ResultGatherer::new(ctx.gather_mode)
            .with_adjustment(SharedAdjustment::scale(labels::SAMPLING_RATE, factor))
            .gather(&Self::outputs(ctx, input), input)?;

        let mut outputs = ProtocolOutputs::new();
        outputs.insert("micrographs".to_string(), set);
        Ok(outputs)
    }

    fn summary(&self, ctx: &ProtocolContext, result: &RunResult) -> Vec<String> {
        let source = ctx.params.get_reference(INPUT).unwrap_or("?");
        let factor = ctx.params.get_float(FACTOR).unwrap_or_default();
        vec![
            format!("Downsampling of micrographs from <{}> by a factor <{:.2}>", source, factor),
            format!(
                "{} of {} steps done",
                result.completed_steps() + result.satisfied_steps(),
                result.steps.len()
            ),
        ]
    }
}

/// Write `micrographs.xmd` (and `tilted_pairs.xmd`) for the downsampled set
fn gather_results(
    store: &dyn MetadataStore,
    ctx: &StepContext,
    import_dir: Option<&Path>,
    io_map: &HashMap<String, PathBuf>,
    input: &RecordSet,
    factor: f64,
) -> Result<()> {
    let gatherer =
        ResultGatherer::default().with_adjustment(SharedAdjustment::scale(labels::SAMPLING_RATE, factor));
    let micrographs = ctx.paths.path("micrographs.xmd");

    let imported = import_dir
        .map(|dir| dir.join("micrographs.xmd"))
        .filter(|p| p.exists());

    match imported {
        Some(source) => {
            gatherer.convert_metadata(
                store,
                &source,
                &micrographs,
                Some("micrographs"),
                io_map,
                &[labels::MICROGRAPH],
            )?;
        }
        None => {
            let outputs: Vec<ItemOutput> = input
                .iter()
                .filter_map(|r| {
                    io_map
                        .get(&r.location.display().to_string())
                        .map(|out| ItemOutput::new(r.id, out))
                })
                .collect();
            let set = gatherer.gather(&outputs, input)?;
            gatherer.write_combined(store, &set, &micrographs, Some("micrographs"), labels::MICROGRAPH)?;
        }
    }

    let Some(import_dir) = import_dir else {
        return Ok(());
    };

    let tilted = import_dir.join("tilted_pairs.xmd");
    if tilted.exists() {
        gatherer.convert_metadata(
            store,
            &tilted,
            &ctx.paths.path("tilted_pairs.xmd"),
            Some("micrographPairs"),
            io_map,
            &[labels::MICROGRAPH, labels::MICROGRAPH_TILTED],
        )?;
    }

    let microscope = import_dir.join("microscope.xmd");
    if microscope.exists() {
        link_file(&microscope, &ctx.paths.path("microscope.xmd"))?;
    }

    Ok(())
}

/// Symlink `target` at `link`, replacing whatever is there
fn link_file(target: &Path, link: &Path) -> std::io::Result<()> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    debug!("Linking {} -> {}", link.display(), target.display());

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        fs::copy(target, link).map(|_| ())
    }
}
