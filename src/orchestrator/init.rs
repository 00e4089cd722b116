//! Run initialisation: snapshot the config, materialise the unit
//! enumeration, partition chunks, and write the initial manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::{PipelineConfig, RunMode, StepScope};
use crate::journal::ChunkJournal;
use crate::manifest::{ChunkInfo, MANIFEST_FILE, Manifest, ManifestStore, RunMetadata, RunStatus};
use crate::provider::registry;
use crate::runlog::RunLog;
use crate::units::{generate_units, partition_chunks};

use super::{CONFIG_DIR, CONFIG_FILE, Orchestrator, pid};

/// CLI-level overrides applied at init.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub max_units: Option<u64>,
    pub mode: Option<RunMode>,
}

/// Create a run directory from a config file. Fails if the directory
/// already holds a run.
pub fn init_run(
    run_dir: &Path,
    config_path: &Path,
    options: &InitOptions,
) -> Result<Orchestrator> {
    if run_dir.join(MANIFEST_FILE).exists() {
        bail!(
            "Run directory {} already contains a run; choose a fresh directory",
            run_dir.display()
        );
    }
    let mut config = PipelineConfig::load(config_path)?;
    let errors = crate::config::validate::validate_config(&config);
    if !errors.is_empty() {
        bail!("Config is invalid:\n  - {}", errors.join("\n  - "));
    }

    if let Some(max_units) = options.max_units {
        config.processing.max_units = Some(max_units);
    }
    if let Some(mode) = options.mode {
        config.api.mode = mode;
    }

    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    // Units come from the live config tree; everything after init reads
    // only the snapshot.
    let units = generate_units(&config.processing, &config_dir)?;
    let config_hash = snapshot_config(run_dir, &mut config, &config_dir)?;

    let chunks = partition_chunks(&units, config.processing.chunk_size);
    let pipeline = config.chunk_scope_step_names();
    let first_step = pipeline
        .first()
        .cloned()
        .context("Pipeline has no chunk-scope steps")?;

    let log = RunLog::new(run_dir);
    let mut chunk_infos = std::collections::BTreeMap::new();
    for (chunk_name, chunk_units) in &chunks {
        let journal = ChunkJournal::new(run_dir, chunk_name);
        std::fs::create_dir_all(journal.dir())
            .with_context(|| format!("Failed to create {}", journal.dir().display()))?;
        journal.write_units(chunk_units)?;
        chunk_infos.insert(
            chunk_name.clone(),
            ChunkInfo::new(chunk_units.len() as u64, &first_step),
        );
    }

    let provider = config.api.provider.to_lowercase();
    let model = config
        .api
        .model
        .clone()
        .or_else(|| registry::default_model(&provider))
        .unwrap_or_default();
    let metadata = RunMetadata {
        mode: config.api.mode,
        provider,
        model,
        pipeline_name: config.pipeline.name.clone(),
        initial_input_tokens: 0,
        initial_output_tokens: 0,
        retry_input_tokens: 0,
        retry_output_tokens: 0,
        max_units: config.processing.max_units,
        poll_interval: config.api.poll_interval,
        config_hash: Some(config_hash),
    };

    let mut manifest = Manifest::new(pipeline, metadata);
    manifest.chunks = chunk_infos;
    if manifest.chunks.is_empty() {
        // an empty enumeration is immediately a complete run
        manifest.status = RunStatus::Complete;
        manifest.completed_at = Some(Utc::now());
    }

    let mut store = ManifestStore::new(run_dir);
    store.save(&mut manifest)?;
    pid::write_pid_file(run_dir)?;
    log.log(
        "STATE",
        &format!(
            "initialised run: {} unit(s) in {} chunk(s), mode {}",
            units.len(),
            manifest.chunks.len(),
            config.api.mode
        ),
    );

    Orchestrator::open(run_dir)
}

/// Snapshot the config plus every template, schema, and the items file
/// into `config/`, rewriting references to snapshot-relative basenames.
/// Returns the SHA-256 of the snapshotted config.
fn snapshot_config(
    run_dir: &Path,
    config: &mut PipelineConfig,
    config_dir: &Path,
) -> Result<String> {
    let snapshot_dir = run_dir.join(CONFIG_DIR);
    let templates_dir = snapshot_dir.join("templates");
    let schemas_dir = snapshot_dir.join("schemas");
    std::fs::create_dir_all(&templates_dir)?;
    std::fs::create_dir_all(&schemas_dir)?;

    let mut template_files = BTreeSet::new();
    let mut schema_files = BTreeSet::new();
    for step in &config.pipeline.steps {
        if step.scope == StepScope::Expression {
            continue;
        }
        if let Some(file) = config.template_for(step) {
            template_files.insert(file.to_string());
        }
        if let Some(file) = config.schema_file_for(&step.name) {
            schema_files.insert(file.to_string());
        }
    }

    for file in &template_files {
        copy_as_basename(config_dir, file, &templates_dir)?;
    }
    for file in &schema_files {
        copy_as_basename(config_dir, file, &schemas_dir)?;
    }

    // rewrite references so the snapshot is self-contained
    for step in &mut config.pipeline.steps {
        if let Some(file) = &step.prompt_template {
            step.prompt_template = Some(basename(file));
        }
    }
    for file in config.prompts.values_mut() {
        *file = basename(file);
    }
    for file in config.schemas.values_mut() {
        *file = basename(file);
    }
    if let Some(source) = &config.processing.items.source {
        let target = basename(source);
        copy_as_basename(config_dir, source, &snapshot_dir)?;
        config.processing.items.source = Some(target);
    }

    let serialized = serde_yaml::to_string(config).context("Failed to serialize config snapshot")?;
    let snapshot_path = snapshot_dir.join(CONFIG_FILE);
    std::fs::write(&snapshot_path, &serialized)
        .with_context(|| format!("Failed to write {}", snapshot_path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn copy_as_basename(config_dir: &Path, file: &str, target_dir: &Path) -> Result<()> {
    let source = config_dir.join(file);
    let target = target_dir.join(basename(file));
    std::fs::copy(&source, &target).with_context(|| {
        format!(
            "Failed to snapshot {} into {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}
