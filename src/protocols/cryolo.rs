//! Particle picking training data for crYOLO
//!
//! The user picks particles interactively (unless coordinates are imported
//! from a folder); the picked coordinates become per-micrograph `.box`
//! annotation files and a generalized model configuration is written next
//! to them.

use crate::core::{
    InputSets, ParamDecl, ParamValue, ParameterSet, RecordSet, RunResult, Step, StepContext,
    StepGraph, StepRole,
};
use crate::error::Result;
use crate::metadata::{labels, MetadataStore, Value, ACQUISITION_BLOCK};
use crate::protocols::{Protocol, ProtocolContext};
use serde_json::json;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NAME: &str = "particle_pick_cryolo";

const INPUT: &str = "input_micrographs";
const IMPORT_FOLDER: &str = "import_folder";
const MEMORY: &str = "memory";
const INPUT_SIZE: &str = "input_size";
const BOX_SIZE: &str = "box_size";
const BATCH_SIZE: &str = "batch_size";
const LEARNING_RATE: &str = "learning_rate";
const MAX_BOX_PER_IMAGE: &str = "max_box_per_image";

const CONFIG_FILE: &str = "config_generalized_model.json";
const ANNOTATION_DIR: &str = "train_annotation";

/// Manual picking followed by crYOLO training set preparation
#[derive(Debug, Clone, Copy, Default)]
pub struct CryoloPicking;

/// Model settings written to the configuration file
#[derive(Debug, Clone, Copy, PartialEq)]
struct ModelConfig {
    input_size: i64,
    box_size: i64,
    max_box_per_image: i64,
    batch_size: i64,
    learning_rate: f64,
}

impl ModelConfig {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        Ok(Self {
            input_size: params.get_int(INPUT_SIZE)?,
            box_size: params.get_int(BOX_SIZE)?,
            max_box_per_image: params.get_int(MAX_BOX_PER_IMAGE)?,
            batch_size: params.get_int(BATCH_SIZE)?,
            learning_rate: params.get_float(LEARNING_RATE)?,
        })
    }

    fn to_json(self) -> serde_json::Value {
        json!({
            "model": {
                "architecture": "crYOLO",
                "input_size": self.input_size,
                "anchors": [self.box_size, self.box_size],
                "max_box_per_image": self.max_box_per_image,
            },
            "train": {
                "train_image_folder": "train_image/",
                "train_annot_folder": "train_annotation/",
                "train_times": 10,
                "pretrained_weights": "model.h5",
                "batch_size": self.batch_size,
                "learning_rate": self.learning_rate,
                "nb_epoch": 50,
                "warmup_epochs": 0,
                "object_scale": 5.0,
                "no_object_scale": 1.0,
                "coord_scale": 1.0,
                "class_scale": 1.0,
                "log_path": "logs/",
                "saved_weights_name": "model.h5",
                "debug": true,
            },
            "valid": {
                "valid_image_folder": "",
                "valid_annot_folder": "",
                "valid_times": 1,
            },
        })
    }
}

impl Protocol for CryoloPicking {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> Vec<ParamDecl> {
        vec![
            ParamDecl::reference(INPUT).required(),
            ParamDecl::path(IMPORT_FOLDER),
            ParamDecl::float(MEMORY).default(ParamValue::Float(2.0)),
            ParamDecl::int(INPUT_SIZE).default(ParamValue::Int(1024)),
            ParamDecl::int(BOX_SIZE).default(ParamValue::Int(50)),
            ParamDecl::int(BATCH_SIZE).default(ParamValue::Int(3)),
            ParamDecl::float(LEARNING_RATE).default(ParamValue::Float(1e-4)),
            ParamDecl::int(MAX_BOX_PER_IMAGE).default(ParamValue::Int(600)),
        ]
    }

    fn validate(&self, params: &ParameterSet, _inputs: &InputSets) -> Vec<String> {
        let mut errors = Vec::new();
        if params.get_int(BOX_SIZE).map(|b| b <= 0).unwrap_or(false) {
            errors.push("Box size must be positive".to_string());
        }
        if let Ok(folder) = params.get_path(IMPORT_FOLDER) {
            if !folder.is_dir() {
                errors.push(format!("Import folder {} does not exist", folder.display()));
            }
        }
        errors
    }

    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph> {
        let micrographs = ctx.inputs.resolve(&ctx.params, INPUT)?.clone();
        let model = ModelConfig::from_params(&ctx.params)?;
        let mut builder = ctx.graph_builder();
        let setup = builder.add_step(ctx.setup_step());

        let mic_file = ctx.paths.path("input_micrographs.xmd");
        let store = ctx.store.clone();
        let output = mic_file.clone();
        let set = micrographs.clone();
        let write_mics = builder.add_step(
            Step::function("write_micrographs", "write_micrographs", move |_: &StepContext| {
                set.save(store.as_ref(), &output, Some("micrographs"), labels::MICROGRAPH, ACQUISITION_BLOCK)
            })
            .fingerprint_with(micrographs.len())
            .verify(&mic_file)
            .after(setup),
        );

        let (coords_dir, picked) = match ctx.params.get_path(IMPORT_FOLDER) {
            Ok(folder) => {
                info!("Using coordinates from {}", folder.display());
                (folder.to_path_buf(), write_mics)
            }
            Err(_) => {
                let memory = format!("{}g", ctx.params.get_float(MEMORY)?.round() as i64);
                let cmd = ctx
                    .command("xmipp_micrograph_particle_picking")?
                    .arg_path("-i", &mic_file)
                    .arg_path("-o", &ctx.paths.extra_dir())
                    .arg("--mode", "manual")
                    .env("XMIPP_MEMORY", memory)
                    .interactive();
                let pick = builder.add_step(
                    Step::command("pick_particles", cmd)
                        .input(&mic_file)
                        .after(write_mics),
                );
                (ctx.paths.extra_dir(), pick)
            }
        };

        let store = ctx.store.clone();
        let annotations = ctx.paths.extra_path(ANNOTATION_DIR);
        let box_size = model.box_size;
        let convert = builder.add_step(
            Step::function("convert_train_coords", "convert_train_coords", move |_: &StepContext| {
                convert_train_coords(store.as_ref(), &micrographs, &coords_dir, &annotations, box_size)
            })
            .fingerprint_with(format!("box={}", box_size))
            .after(picked)
            .role(StepRole::Gather),
        );

        let config_file = ctx.paths.extra_path(CONFIG_FILE);
        let output = config_file.clone();
        builder.add_step(
            Step::function("create_configuration", "create_configuration", move |_: &StepContext| {
                write_config(model, &output)
            })
            .fingerprint_with(format!("{:?}", model))
            .verify(&config_file)
            .after(convert)
            .role(StepRole::Finalize),
        );

        builder.build()
    }

    fn summary(&self, ctx: &ProtocolContext, _result: &RunResult) -> Vec<String> {
        let annotated = fs::read_dir(ctx.paths.extra_path(ANNOTATION_DIR))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "box"))
                    .count()
            })
            .unwrap_or(0);
        let micrographs = ctx
            .inputs
            .resolve(&ctx.params, INPUT)
            .map(RecordSet::len)
            .unwrap_or(0);
        vec![format!(
            "{} of {} micrographs have training annotations",
            annotated, micrographs
        )]
    }
}

/// One `.box` file per micrograph with picked coordinates
///
/// Coordinates are read from `<coords_dir>/<stem>.pos`; micrographs without
/// a coordinate file get no annotation.
fn convert_train_coords(
    store: &dyn MetadataStore,
    micrographs: &RecordSet,
    coords_dir: &Path,
    annotations: &Path,
    box_size: i64,
) -> Result<()> {
    fs::create_dir_all(annotations)?;

    let mut written = 0;
    for micrograph in micrographs.iter() {
        let stem = micrograph.stem();
        let pos = coords_dir.join(format!("{}.pos", stem));
        if !pos.exists() {
            debug!("No coordinates for {}", stem);
            continue;
        }

        let table = store.open(&pos, None)?;
        let mut content = String::new();
        for row in table.iter() {
            let x = coordinate(table.require(labels::X, row, &pos)?);
            let y = coordinate(table.require(labels::Y, row, &pos)?);
            let _ = writeln!(content, "{}\t{}\t{}\t{}", x, y, box_size, box_size);
        }

        let box_file: PathBuf = annotations.join(format!("{}.box", stem));
        fs::write(&box_file, content)?;
        written += 1;
    }

    info!("Wrote {} training annotation files", written);
    Ok(())
}

fn coordinate(value: &Value) -> String {
    match value.as_i64() {
        Some(v) => v.to_string(),
        None => value.to_string(),
    }
}

fn write_config(model: ModelConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&model.to_json())?;
    fs::write(path, text)?;
    Ok(())
}
