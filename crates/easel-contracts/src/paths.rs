use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::prompts::is_prompt_id;

/// `promptId/filename`, the composite path under which a generated image is
/// referenced by both the live session and its history record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImagePath {
    prompt_id: String,
    filename: String,
}

impl ImagePath {
    pub fn new(prompt_id: impl Into<String>, filename: impl Into<String>) -> Result<Self> {
        let prompt_id = prompt_id.into();
        let filename = filename.into();
        if !is_prompt_id(&prompt_id) {
            bail!("invalid prompt id segment: {prompt_id:?}");
        }
        if !is_plain_filename(&filename) {
            bail!("invalid image filename: {filename:?}");
        }
        Ok(Self {
            prompt_id,
            filename,
        })
    }

    /// Parses a composite path; anything but exactly two safe segments fails.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        let [prompt_id, filename] = parts.as_slice() else {
            bail!("image path must look like <prompt_id>/<filename>, got {raw:?}");
        };
        Self::new(*prompt_id, *filename)
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn resolve(&self, images_dir: &Path) -> PathBuf {
        images_dir.join(&self.prompt_id).join(&self.filename)
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prompt_id, self.filename)
    }
}

pub fn is_plain_filename(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}
