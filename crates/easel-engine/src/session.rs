use std::path::PathBuf;

use easel_contracts::history::HistoryRecord;
use easel_contracts::prompts::PromptPair;

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 1200;
pub const DEFAULT_COUNT: u64 = 10;

/// The single process-wide generation session.
///
/// Only the controller and the worker mutate it, always under the session
/// lock. `produced_count` tracks `images.len()` after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub running: bool,
    pub stop_requested: bool,
    pub prompt_text: Option<String>,
    pub prompt_id: Option<String>,
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub reference_image: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub target_count: u64,
    pub produced_count: u64,
    pub images: Vec<String>,
    pub last_error: Option<String>,
    /// Bumped whenever the session is re-pointed at another prompt, so a
    /// worker can tell its in-flight batch no longer belongs here.
    pub(crate) epoch: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            running: false,
            stop_requested: false,
            prompt_text: None,
            prompt_id: None,
            positive_prompt: None,
            negative_prompt: None,
            reference_image: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_count: 0,
            produced_count: 0,
            images: Vec::new(),
            last_error: None,
            epoch: 0,
        }
    }
}

impl SessionState {
    /// Re-points the session at a new prompt with no images yet.
    pub(crate) fn reset(
        &mut self,
        prompt_text: &str,
        count: u64,
        width: u32,
        height: u32,
        reference_image: Option<PathBuf>,
    ) {
        self.prompt_text = Some(prompt_text.to_string());
        self.prompt_id = None;
        self.positive_prompt = None;
        self.negative_prompt = None;
        self.reference_image = reference_image;
        self.width = width;
        self.height = height;
        self.target_count = count;
        self.images.clear();
        self.produced_count = 0;
        self.last_error = None;
        self.epoch += 1;
    }

    pub(crate) fn extend(&mut self, count: u64, reference_image: Option<PathBuf>) {
        self.target_count = self.target_count.saturating_add(count);
        if reference_image.is_some() {
            self.reference_image = reference_image;
        }
    }

    /// Overwrites the session from a stored record, leaving nothing pending.
    pub(crate) fn load_record(&mut self, record: &HistoryRecord) {
        self.prompt_text = Some(record.prompt_text.clone());
        self.prompt_id = Some(record.id.clone());
        self.positive_prompt = Some(record.positive_prompt.clone());
        self.negative_prompt = Some(record.negative_prompt.clone());
        self.reference_image = None;
        self.width = record.width;
        self.height = record.height;
        self.images = record.image_paths();
        self.produced_count = self.images.len() as u64;
        self.target_count = self.produced_count;
        self.running = false;
        self.stop_requested = false;
        self.last_error = None;
        self.epoch += 1;
    }

    pub(crate) fn set_prompt_pair(&mut self, prompt_id: &str, pair: &PromptPair) {
        self.prompt_id = Some(prompt_id.to_string());
        self.positive_prompt = Some(pair.positive.clone());
        self.negative_prompt = Some(pair.negative.clone());
    }

    pub(crate) fn push_image(&mut self, path: String) {
        self.images.push(path);
        self.produced_count = self.images.len() as u64;
    }

    /// Removes `path` from the live list; returns whether it was listed.
    pub(crate) fn remove_image(&mut self, path: &str) -> bool {
        let Some(idx) = self.images.iter().position(|listed| listed == path) else {
            return false;
        };
        self.images.remove(idx);
        self.produced_count = self.images.len() as u64;
        true
    }

    pub(crate) fn clear_images(&mut self) {
        self.images.clear();
        self.produced_count = 0;
        self.target_count = 0;
        self.epoch += 1;
    }

    pub fn is_target_met(&self) -> bool {
        self.produced_count >= self.target_count
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            running: self.running,
            stop_requested: self.stop_requested,
            prompt_text: self.prompt_text.clone(),
            prompt_id: self.prompt_id.clone(),
            positive_prompt: self.positive_prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            reference_image: self
                .reference_image
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            width: self.width,
            height: self.height,
            target_count: self.target_count,
            produced_count: self.produced_count,
            images: self.images.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Detached copy of [`SessionState`] handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub running: bool,
    pub stop_requested: bool,
    pub prompt_text: Option<String>,
    pub prompt_id: Option<String>,
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub reference_image: Option<String>,
    pub width: u32,
    pub height: u32,
    pub target_count: u64,
    pub produced_count: u64,
    pub images: Vec<String>,
    pub last_error: Option<String>,
}
