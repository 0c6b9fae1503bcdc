//! Resolution estimation of a 3D reconstruction

use crate::core::{
    InputSets, ParamDecl, ParamValue, ParameterSet, Record, RecordSet, RunResult, Step, StepGraph,
    StepRole,
};
use crate::error::Result;
use crate::gather::{ItemOutput, ResultGatherer};
use crate::metadata::labels;
use crate::protocols::{Protocol, ProtocolContext, ProtocolOutputs};
use std::path::PathBuf;
use tracing::warn;

pub const NAME: &str = "resolution_3d";

const INPUT_VOLUME: &str = "input_volume";
const REFERENCE_VOLUME: &str = "reference_volume";
const SAMPLING_RATE: &str = "sampling_rate";
const DO_FSC: &str = "do_fsc";
const DO_STRUCTURE_FACTOR: &str = "do_structure_factor";
const DO_SSNR: &str = "do_ssnr";
const DO_VSSNR: &str = "do_vssnr";

const FSC_FILE: &str = "fsc.xmd";
const STRUCTURE_FACTOR_FILE: &str = "structureFactor.xmd";

/// FSC/DPR against a reference volume and the structure factor of a volume
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolution3D;

impl Resolution3D {
    fn outputs(ctx: &ProtocolContext) -> Vec<ItemOutput> {
        let mut outputs = Vec::new();
        if ctx.params.flag(DO_FSC) {
            outputs.push(ItemOutput::new(1, ctx.paths.path(FSC_FILE)));
        }
        if ctx.params.flag(DO_STRUCTURE_FACTOR) {
            outputs.push(ItemOutput::new(2, ctx.paths.path(STRUCTURE_FACTOR_FILE)));
        }
        outputs
    }
}

impl Protocol for Resolution3D {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> Vec<ParamDecl> {
        vec![
            ParamDecl::path(INPUT_VOLUME).required(),
            ParamDecl::path(REFERENCE_VOLUME),
            ParamDecl::float(SAMPLING_RATE).required(),
            ParamDecl::bool(DO_FSC).default(ParamValue::Bool(true)),
            ParamDecl::bool(DO_STRUCTURE_FACTOR).default(ParamValue::Bool(true)),
            ParamDecl::bool(DO_SSNR).default(ParamValue::Bool(true)),
            ParamDecl::bool(DO_VSSNR).default(ParamValue::Bool(false)),
        ]
    }

    fn validate(&self, params: &ParameterSet, _inputs: &InputSets) -> Vec<String> {
        let mut errors = Vec::new();
        if params.flag(DO_FSC) && !params.contains(REFERENCE_VOLUME) {
            errors.push("Please provide a reference volume.".to_string());
        }
        if params.get_float(SAMPLING_RATE).map(|t| t <= 0.0).unwrap_or(false) {
            errors.push("Sampling rate must be positive".to_string());
        }
        errors
    }

    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph> {
        let volume = ctx.params.get_path(INPUT_VOLUME)?;
        let sampling = ctx.params.get_float(SAMPLING_RATE)?;
        let mut builder = ctx.graph_builder();
        let setup = builder.add_step(ctx.setup_step());

        if ctx.params.flag(DO_FSC) {
            let reference = ctx.params.get_path(REFERENCE_VOLUME)?;
            let output = ctx.paths.path(FSC_FILE);
            let cmd = ctx
                .command("xmipp_resolution_fsc")?
                .arg_path("--ref", reference)
                .arg_path("-i", volume)
                .arg_path("-o", &output)
                .arg_f64("--sampling_rate", sampling)
                .switch("--do_dpr");
            builder.add_step(
                Step::command("calculate_fsc", cmd)
                    .input(reference)
                    .input(volume)
                    .verify(output)
                    .after(setup)
                    .parallel()
                    .role(StepRole::Item),
            );
        }

        if ctx.params.flag(DO_STRUCTURE_FACTOR) {
            let output = ctx.paths.path(STRUCTURE_FACTOR_FILE);
            let cmd = ctx
                .command("xmipp_volume_structure_factor")?
                .arg_path("-i", volume)
                .arg_path("-o", &output)
                .arg_f64("--sampling", sampling);
            builder.add_step(
                Step::command("structure_factor", cmd)
                    .input(volume)
                    .verify(output)
                    .after(setup)
                    .parallel()
                    .role(StepRole::Item),
            );
        }

        if ctx.params.flag(DO_SSNR) || ctx.params.flag(DO_VSSNR) {
            warn!("Spectral SNR requested but not available; no step scheduled");
        }

        builder.build()
    }

    /// Produced metadata files as records located at those files
    fn gather(&self, ctx: &ProtocolContext, _result: &RunResult) -> Result<ProtocolOutputs> {
        let volume: PathBuf = ctx.params.get_path(INPUT_VOLUME)?.to_path_buf();
        let mut input = RecordSet::new();
        if ctx.params.flag(DO_FSC) {
            input.push(Record::new(1, &volume).with_attr("analysis", "fsc"))?;
        }
        if ctx.params.flag(DO_STRUCTURE_FACTOR) {
            input.push(Record::new(2, &volume).with_attr("analysis", "structure_factor"))?;
        }
        input.set_shared(labels::SAMPLING_RATE, ctx.params.get_float(SAMPLING_RATE)?);

        let set = ResultGatherer::new(ctx.gather_mode).gather(&Self::outputs(ctx), &input)?;

        let mut outputs = ProtocolOutputs::new();
        outputs.insert("resolution".to_string(), set);
        Ok(outputs)
    }

    fn summary(&self, ctx: &ProtocolContext, _result: &RunResult) -> Vec<String> {
        let volume = ctx
            .params
            .get_path(INPUT_VOLUME)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        vec![format!("Input volume: {}", volume)]
    }
}
