//! Random conical tilt reconstruction
//!
//! Starts from a finished ML2D classification of the untilted images. For
//! every selected 2D class the untilted images of the class and their tilted
//! partners are collected and the in-plane alignment of the last ML2D
//! iteration is assigned to the untilted images. The tilted images are then
//! aligned against the untilted ones, and a volume is reconstructed from
//! them and optionally low-pass filtered.

use crate::core::{
    InputSets, ParamDecl, ParamValue, ParameterSet, Record, RecordSet, RunResult, Step,
    StepContext, StepGraph, StepRole,
};
use crate::error::{PipelineError, Result};
use crate::gather::{GatherMode, ItemOutput, ResultGatherer};
use crate::metadata::{labels, MetadataStore, ACQUISITION_BLOCK};
use crate::protocols::{Protocol, ProtocolContext, ProtocolOutputs};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NAME: &str = "rct";

const UNTILTED: &str = "untilted_images";
const TILTED: &str = "tilted_images";
const ML2D_DIR: &str = "ml2d_dir";
const ML2D_ROOT: &str = "ml2d_root";
const SELECT_CLASSES: &str = "select_classes";
const CENTER_MAX_SHIFT: &str = "center_max_shift";
const DO_UNTILTED_HEADERS: &str = "do_untilted_headers";
const ALIGN_ARGS: &str = "align_tilt_pairs_args";
const RECONSTRUCT_METHOD: &str = "reconstruct_method";
const RECONSTRUCT_ARGS: &str = "reconstruct_args";
const DO_LOW_PASS: &str = "do_low_pass";
const LOW_PASS: &str = "low_pass_filter";
const PIXEL_SIZE: &str = "pixel_size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconstruction {
    Fourier,
    Art,
    Wbp,
}

impl Reconstruction {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fourier" => Some(Reconstruction::Fourier),
            "art" => Some(Reconstruction::Art),
            "wbp" => Some(Reconstruction::Wbp),
            _ => None,
        }
    }

    fn program(self) -> &'static str {
        match self {
            Reconstruction::Fourier => "xmipp_reconstruct_fourier",
            Reconstruction::Art => "xmipp_reconstruct_art",
            Reconstruction::Wbp => "xmipp_reconstruct_wbp",
        }
    }
}

/// Last iteration of a finished ML2D classification
#[derive(Debug, Clone)]
struct Ml2dRun {
    dir: PathBuf,
    root: String,
    /// `<root>_itNNNNNN`
    last: String,
}

impl Ml2dRun {
    /// Find the last iteration under `dir`, refusing runs that are not done
    /// yet or that classified mirrored images
    fn open(dir: &Path, root: &str) -> Result<Self> {
        let docfile = Regex::new(&format!(r"^{}_it(\d{{6}})\.doc$", regex::escape(root)))
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let entries = fs::read_dir(dir).map_err(|e| {
            PipelineError::config(format!("Cannot read ML2D directory {}: {}", dir.display(), e))
        })?;
        let iteration = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                docfile.captures(&name).and_then(|c| c[1].parse::<u32>().ok())
            })
            .max()
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "No ML2D docfiles yet in {}. Continue after ML2D job completion",
                    dir.display()
                ))
            })?;

        let run = Self {
            dir: dir.to_path_buf(),
            root: root.to_string(),
            last: format!("{}_it{:06}", root, iteration),
        };

        let log = run.dir.join(format!("{}.log", run.last));
        let content = fs::read_to_string(&log).map_err(|e| {
            PipelineError::config(format!("Cannot read ML2D log {}: {}", log.display(), e))
        })?;
        if content.lines().any(|line| line.contains("-mirror")) {
            return Err(PipelineError::config(
                "You cannot use the -mirror flag if you want to do RCT; repeat the ML2D run without it",
            ));
        }

        debug!("ML2D run {} ends at {}", run.dir.display(), run.last);
        Ok(run)
    }

    fn from_params(params: &ParameterSet) -> Result<Self> {
        let root = match params.get_text(ML2D_ROOT)? {
            "" => "ml2d",
            root => root,
        };
        Self::open(params.get_path(ML2D_DIR)?, root)
    }

    fn class_selfile(&self, class: i64) -> PathBuf {
        self.dir.join(format!("{}_ref{:06}.sel", self.root, class))
    }

    fn class_average(&self, class: i64) -> PathBuf {
        self.dir.join(format!("{}_ref{:06}.xmp", self.last, class))
    }

    /// Angles and shifts of every image in the last iteration
    fn docfile(&self) -> PathBuf {
        self.dir.join(format!("{}.doc", self.last))
    }
}

/// Files of one class; local copies live in the working directory
#[derive(Debug, Clone)]
struct ClassFiles {
    class: i64,
    source: PathBuf,
    average_source: PathBuf,
    untilted: PathBuf,
    untilted_doc: PathBuf,
    average: PathBuf,
    tilted: PathBuf,
    doc: PathBuf,
    volume: PathBuf,
    filtered: PathBuf,
}

impl ClassFiles {
    fn new(ctx: &ProtocolContext, ml2d: &Ml2dRun, class: i64) -> Self {
        let local = format!("rct_ref{:06}", class);
        Self {
            class,
            source: ml2d.class_selfile(class),
            average_source: ml2d.class_average(class),
            untilted: ctx.paths.path(format!("{}_untilted.sel", local)),
            untilted_doc: ctx.paths.path(format!("{}_untilted.doc", local)),
            average: ctx.paths.path(format!("{}_untilted_avg.xmp", local)),
            tilted: ctx.paths.path(format!("{}_tilted.sel", local)),
            doc: ctx.paths.path(format!("{}_tilted.doc", local)),
            volume: ctx.paths.path(format!("{}_tilted.vol", local)),
            filtered: ctx.paths.path(format!("{}_tilted_filtered.vol", local)),
        }
    }

    /// Output name without extension, as the ART program expects
    fn volume_root(&self) -> PathBuf {
        self.volume.with_extension("")
    }
}

/// Random conical tilt volumes from selected 2D classes
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomConicalTilt;

impl RandomConicalTilt {
    fn classes(ctx: &ProtocolContext, ml2d: &Ml2dRun) -> Result<Vec<ClassFiles>> {
        Ok(ctx
            .params
            .get_int_list(SELECT_CLASSES)?
            .into_iter()
            .map(|class| ClassFiles::new(ctx, ml2d, class))
            .collect())
    }

    fn final_volume(ctx: &ProtocolContext, files: &ClassFiles) -> PathBuf {
        if ctx.params.flag(DO_LOW_PASS) {
            files.filtered.clone()
        } else {
            files.volume.clone()
        }
    }
}

impl Protocol for RandomConicalTilt {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> Vec<ParamDecl> {
        vec![
            ParamDecl::reference(UNTILTED).required(),
            ParamDecl::reference(TILTED).required(),
            ParamDecl::path(ML2D_DIR).required(),
            ParamDecl::text(ML2D_ROOT).default(ParamValue::Text("ml2d".into())),
            ParamDecl::text(SELECT_CLASSES).required(),
            ParamDecl::bool(DO_UNTILTED_HEADERS).default(ParamValue::Bool(true)),
            ParamDecl::int(CENTER_MAX_SHIFT).default(ParamValue::Int(999)),
            ParamDecl::text(ALIGN_ARGS).default(ParamValue::Text(String::new())),
            ParamDecl::text(RECONSTRUCT_METHOD).default(ParamValue::Text("fourier".into())),
            ParamDecl::text(RECONSTRUCT_ARGS).default(ParamValue::Text(String::new())),
            ParamDecl::bool(DO_LOW_PASS).default(ParamValue::Bool(true)),
            ParamDecl::float(LOW_PASS).default(ParamValue::Float(50.0)),
            ParamDecl::float(PIXEL_SIZE),
        ]
    }

    fn validate(&self, params: &ParameterSet, inputs: &InputSets) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = params.get_int_list(SELECT_CLASSES) {
            errors.push(e.to_string());
        }
        if let Err(e) = Ml2dRun::from_params(params) {
            errors.push(e.to_string());
        }
        if let Ok(method) = params.get_text(RECONSTRUCT_METHOD) {
            if Reconstruction::parse(method).is_none() {
                errors.push(format!("unrecognized reconstruction method: {}", method));
            }
        }
        for input in [UNTILTED, TILTED] {
            if let Err(e) = inputs.resolve(params, input) {
                errors.push(e.to_string());
            }
        }
        if params.flag(DO_LOW_PASS) && !params.contains(PIXEL_SIZE) {
            let sampled = inputs
                .resolve(params, UNTILTED)
                .map(|set| set.sampling_rate().is_some())
                .unwrap_or(false);
            if !sampled {
                errors.push("Low-pass filtering needs a pixel size".to_string());
            }
        }
        errors
    }

    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph> {
        let untilted = ctx.inputs.resolve(&ctx.params, UNTILTED)?;
        let tilted = ctx.inputs.resolve(&ctx.params, TILTED)?;
        let method_name = ctx.params.get_text(RECONSTRUCT_METHOD)?;
        let method = Reconstruction::parse(method_name).ok_or_else(|| {
            PipelineError::config(format!("unrecognized reconstruction method: {}", method_name))
        })?;

        let mut builder = ctx.graph_builder();
        let setup = builder.add_step(ctx.setup_step());

        let ml2d = Ml2dRun::from_params(&ctx.params)?;
        let pairs = tilt_pairs(untilted, tilted);

        for files in Self::classes(ctx, &ml2d)? {
            let class = files.class;

            let store = ctx.store.clone();
            let prepared = files.clone();
            let pair_map = pairs.clone();
            let prepare = builder.add_step(
                Step::function(format!("prepare_class[{}]", class), "make_local_copies", move |_: &StepContext| {
                    make_local_copies(store.as_ref(), &prepared, &pair_map)
                })
                .fingerprint_with(format!("{} {}", files.source.display(), files.average_source.display()))
                .input(&files.source)
                .input(&files.average_source)
                .verify(&files.untilted)
                .verify(&files.average)
                .verify(&files.tilted)
                .after(setup)
                .parallel()
                .role(StepRole::Item),
            );

            let cmd = ctx
                .command("xmipp_docfile_select_subset")?
                .arg_path("-i", &ml2d.docfile())
                .arg_path("-sel", &files.untilted)
                .arg_path("-o", &files.untilted_doc);
            let mut untilted_ready = builder.add_step(
                Step::command(format!("select_angles[{}]", class), cmd)
                    .input(&files.untilted)
                    .verify(&files.untilted_doc)
                    .after(prepare)
                    .parallel()
                    .role(StepRole::Item),
            );

            if ctx.params.flag(DO_UNTILTED_HEADERS) {
                let cmd = ctx
                    .command("xmipp_header_assign")?
                    .arg_path("-i", &files.untilted_doc)
                    .arg_path("-o", &files.untilted)
                    .switch("-force")
                    .args("-columns", [0, 0, 3, 4, 5]);
                let assign = builder.add_step(
                    Step::command(format!("assign_headers[{}]", class), cmd)
                        .input(&files.untilted_doc)
                        .after(untilted_ready)
                        .parallel()
                        .role(StepRole::Item),
                );

                let cmd = ctx
                    .command("xmipp_header_extract")?
                    .arg_path("-i", &files.untilted)
                    .arg_path("-o", &files.untilted_doc);
                untilted_ready = builder.add_step(
                    Step::command(format!("extract_headers[{}]", class), cmd)
                        .input(&files.untilted)
                        .verify(&files.untilted_doc)
                        .after(assign)
                        .parallel()
                        .role(StepRole::Item),
                );
            }

            let cmd = ctx
                .command("xmipp_align_tilt_pairs")?
                .arg_path("-u", &files.untilted)
                .arg_path("-t", &files.tilted)
                .arg_path("-doc", &files.doc)
                .arg("-max_shift", ctx.params.get_int(CENTER_MAX_SHIFT)?)
                .extra(ctx.params.get_text(ALIGN_ARGS)?);
            let align = builder.add_step(
                Step::command(format!("align_tilt_pairs[{}]", class), cmd)
                    .input(&files.untilted)
                    .input(&files.tilted)
                    .verify(&files.doc)
                    .after(untilted_ready)
                    .parallel()
                    .role(StepRole::Item),
            );

            let output = match method {
                Reconstruction::Art => files.volume_root(),
                Reconstruction::Fourier | Reconstruction::Wbp => files.volume.clone(),
            };
            let cmd = ctx
                .command(method.program())?
                .arg_path("-i", &files.tilted)
                .arg_path("-o", &output)
                .extra(ctx.params.get_text(RECONSTRUCT_ARGS)?);
            let reconstruct = builder.add_step(
                Step::command(format!("reconstruct[{}]", class), cmd)
                    .input(&files.tilted)
                    .verify(&files.volume)
                    .after(align)
                    .parallel()
                    .role(StepRole::Item),
            );

            if ctx.params.flag(DO_LOW_PASS) {
                let pixel_size = match ctx.params.get_float(PIXEL_SIZE) {
                    Ok(size) => size,
                    Err(_) => untilted.sampling_rate().ok_or_else(|| {
                        PipelineError::config("Low-pass filtering needs a pixel size")
                    })?,
                };
                let cmd = ctx
                    .command("xmipp_fourier_filter")?
                    .arg_path("-o", &files.filtered)
                    .arg_path("-i", &files.volume)
                    .arg("-sampling", pixel_size)
                    .arg("-low_pass", ctx.params.get_float(LOW_PASS)?);
                builder.add_step(
                    Step::command(format!("low_pass[{}]", class), cmd)
                        .input(&files.volume)
                        .verify(&files.filtered)
                        .after(reconstruct)
                        .parallel()
                        .role(StepRole::Finalize),
                );
            }
        }

        builder.build()
    }

    /// Volumes of the classes that made it to the end; never strict
    fn gather(&self, ctx: &ProtocolContext, _result: &RunResult) -> Result<ProtocolOutputs> {
        let mut classes = RecordSet::new();
        let mut outputs = Vec::new();
        let ml2d = Ml2dRun::from_params(&ctx.params)?;
        for files in Self::classes(ctx, &ml2d)? {
            let id = files.class.max(0) as u64;
            let volume = Self::final_volume(ctx, &files);
            classes.push(Record::new(id, &volume).with_attr(labels::REF, files.class))?;
            outputs.push(ItemOutput::new(id, volume));
        }
        if let Ok(size) = ctx.params.get_float(PIXEL_SIZE) {
            classes.set_shared(labels::SAMPLING_RATE, size);
        } else if let Some(rate) = ctx
            .inputs
            .resolve(&ctx.params, UNTILTED)
            .ok()
            .and_then(RecordSet::sampling_rate)
        {
            classes.set_shared(labels::SAMPLING_RATE, rate);
        }

        let volumes = ResultGatherer::new(GatherMode::Lenient).gather(&outputs, &classes)?;
        info!("RCT produced {} of {} class volumes", volumes.len(), outputs.len());

        let mut result = ProtocolOutputs::new();
        result.insert("volumes".to_string(), volumes);
        Ok(result)
    }
}

/// Untilted image location to its tilted partner, paired by record id
fn tilt_pairs(untilted: &RecordSet, tilted: &RecordSet) -> HashMap<String, PathBuf> {
    untilted
        .iter()
        .filter_map(|u| {
            tilted
                .get(u.id)
                .map(|t| (u.location.display().to_string(), t.location.clone()))
        })
        .collect()
}

/// Copy the class selfile and average, and write the matching tilted selfile
fn make_local_copies(
    store: &dyn MetadataStore,
    files: &ClassFiles,
    pairs: &HashMap<String, PathBuf>,
) -> Result<()> {
    let class = RecordSet::load(store, &files.source, None, labels::IMAGE, None)?;
    class.save(store, &files.untilted, None, labels::IMAGE, ACQUISITION_BLOCK)?;
    fs::copy(&files.average_source, &files.average)?;

    let mut tilted = RecordSet::new();
    for record in class.iter() {
        match pairs.get(&record.location.display().to_string()) {
            Some(partner) => tilted.push(Record::new(record.id, partner))?,
            None => debug!("No tilted partner for {}", record.location.display()),
        }
    }
    tilted.save(store, &files.tilted, None, labels::IMAGE, ACQUISITION_BLOCK)?;

    info!(
        "Class {}: {} untilted, {} tilted images",
        files.class,
        class.len(),
        tilted.len()
    );
    Ok(())
}
