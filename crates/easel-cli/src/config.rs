use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use easel_contracts::events::{EventHub, EventJournal};
use easel_contracts::history::SqliteHistoryStore;
use easel_contracts::prompts::DEFAULT_PROMPT_CACHE_CAPACITY;
use easel_engine::{
    Collaborators, ComfyUiConfig, ComfyUiSynthesizer, DryrunExpander, DryrunSynthesizer,
    ImageSynthesizer, OllamaExpander, OpenAiExpander, PromptExpander, SessionController,
    SessionOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExpanderKind {
    Ollama,
    Openai,
    Dryrun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SynthesizerKind {
    Comfyui,
    Dryrun,
}

/// Settings shared by every subcommand that drives a session.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Root for generated images, uploads, history and the event journal.
    #[arg(long, env = "EASEL_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "AI_PROVIDER", value_enum, default_value_t = ExpanderKind::Ollama, ignore_case = true)]
    pub expander: ExpanderKind,
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,
    #[arg(long, env = "OLLAMA_MODEL", default_value = "qwen3:30b")]
    pub ollama_model: String,
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,

    #[arg(long, env = "EASEL_SYNTHESIZER", value_enum, default_value_t = SynthesizerKind::Comfyui, ignore_case = true)]
    pub synthesizer: SynthesizerKind,
    #[arg(long, env = "COMFYUI_SERVER", default_value = "127.0.0.1:8188")]
    pub comfyui_server: String,
    #[arg(long, env = "EASEL_WORKFLOW", default_value = "config/workflows/default.json")]
    pub workflow: PathBuf,

    #[arg(long, env = "EASEL_PROMPT_CACHE_CAPACITY", default_value_t = DEFAULT_PROMPT_CACHE_CAPACITY)]
    pub prompt_cache_capacity: usize,
    #[arg(long, env = "EASEL_PROMPT_CACHE_TTL_SECS")]
    pub prompt_cache_ttl_secs: Option<u64>,
    #[arg(long, env = "EASEL_ERROR_BACKOFF_MS", default_value_t = 1000)]
    pub error_backoff_ms: u64,
}

/// On-disk layout under `--data-dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub root: PathBuf,
    pub generated: PathBuf,
    pub upload: PathBuf,
    pub history: PathBuf,
    /// Pre-SQLite `history.json`, read only by `easel migrate`.
    pub legacy_history: PathBuf,
    pub events: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            generated: root.join("generated"),
            upload: root.join("upload"),
            history: root.join("history.db"),
            legacy_history: root.join("history.json"),
            events: root.join("events.jsonl"),
            root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.generated, &self.upload] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

impl EngineArgs {
    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn build_expander(&self) -> Result<Arc<dyn PromptExpander>> {
        let expander: Arc<dyn PromptExpander> = match self.expander {
            ExpanderKind::Ollama => {
                Arc::new(OllamaExpander::new(&self.ollama_url, &self.ollama_model)?)
            }
            ExpanderKind::Openai => Arc::new(OpenAiExpander::new(
                &self.openai_base_url,
                self.openai_api_key.clone(),
                &self.openai_model,
            )?),
            ExpanderKind::Dryrun => Arc::new(DryrunExpander),
        };
        Ok(expander)
    }

    pub fn build_synthesizer(&self) -> Result<Arc<dyn ImageSynthesizer>> {
        let synthesizer: Arc<dyn ImageSynthesizer> = match self.synthesizer {
            SynthesizerKind::Comfyui => Arc::new(
                ComfyUiSynthesizer::new(ComfyUiConfig::new(
                    self.comfyui_server.clone(),
                    &self.workflow,
                ))
                .with_context(|| {
                    format!("failed to load ComfyUI workflow {}", self.workflow.display())
                })?,
            ),
            SynthesizerKind::Dryrun => Arc::new(DryrunSynthesizer::default()),
        };
        Ok(synthesizer)
    }

    pub fn session_options(&self, layout: &DataLayout) -> SessionOptions {
        let mut options = SessionOptions::new(&layout.generated);
        options.prompt_cache_capacity = self.prompt_cache_capacity;
        options.prompt_cache_ttl = self.prompt_cache_ttl_secs.map(Duration::from_secs);
        options.error_backoff = Duration::from_millis(self.error_backoff_ms);
        options
    }

    /// Builds the controller and every collaborator it drives.
    ///
    /// HTTP clients here are blocking, so call this outside any async
    /// runtime.
    pub fn build_controller(&self, layout: &DataLayout) -> Result<SessionController> {
        layout.ensure_dirs()?;
        let history = SqliteHistoryStore::open(&layout.history)?;
        let collaborators = Collaborators {
            expander: self.build_expander()?,
            synthesizer: self.build_synthesizer()?,
            history: Arc::new(history),
        };
        tracing::info!(
            expander = collaborators.expander.name(),
            synthesizer = collaborators.synthesizer.name(),
            data_dir = %layout.root.display(),
            "session collaborators ready"
        );
        let events = EventHub::with_journal(EventJournal::new(&layout.events));
        Ok(SessionController::new(
            collaborators,
            self.session_options(layout),
            events,
        ))
    }
}

/// Reads `PROMPT_1`, `PROMPT_2`, ... until the first missing or blank one.
pub fn preset_prompts() -> Vec<String> {
    preset_prompts_from(|key| env::var(key).ok())
}

fn preset_prompts_from(lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    (1..)
        .map(|idx| lookup(&format!("PROMPT_{idx}")))
        .take_while(|value| value.as_deref().is_some_and(|text| !text.trim().is_empty()))
        .flatten()
        .collect()
}

/// Resolves a request's reference image to a file inside the upload
/// directory. Bare names are looked up there; anything that resolves outside
/// it, or does not exist, is rejected.
pub fn resolve_upload_reference(layout: &DataLayout, raw: &str) -> Result<Option<PathBuf>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let path = Path::new(raw);
    let candidate = if path.is_absolute() || path.starts_with(&layout.upload) {
        path.to_path_buf()
    } else {
        layout.upload.join(path)
    };
    let upload_dir = layout
        .upload
        .canonicalize()
        .with_context(|| format!("upload directory {} is missing", layout.upload.display()))?;
    let resolved = candidate
        .canonicalize()
        .with_context(|| format!("reference image {raw} not found"))?;
    if !resolved.starts_with(&upload_dir) || !resolved.is_file() {
        bail!("reference image {raw} is not an uploaded file");
    }
    Ok(Some(resolved))
}
