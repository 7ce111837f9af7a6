use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Pipeline stage an upstream failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prompt,
    Image,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prompt => f.write_str("prompt expansion"),
            Stage::Image => f.write_str("image synthesis"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{stage} failed: {message}")]
    Upstream { stage: Stage, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history store error: {0}")]
    Storage(String),
    #[error("session lock poisoned")]
    LockPoisoned,
}

impl SessionError {
    pub(crate) fn upstream(stage: Stage, err: &anyhow::Error) -> Self {
        SessionError::Upstream {
            stage,
            message: error_chain_text(err, 512),
        }
    }

    pub(crate) fn storage(err: &anyhow::Error) -> Self {
        SessionError::Storage(error_chain_text(err, 512))
    }
}

/// Flattens an error and its causes into one line, skipping repeats.
pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::{error_chain_text, SessionError, Stage};

    #[test]
    fn chain_text_joins_causes_without_repeats() {
        let err = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("ComfyUI submit failed")
            .context("ComfyUI submit failed")
            .unwrap_err();
        assert_eq!(
            error_chain_text(&err, 512),
            "ComfyUI submit failed | caused by: connection refused"
        );
    }

    #[test]
    fn chain_text_truncates() {
        let err = anyhow::anyhow!("x".repeat(20));
        assert_eq!(error_chain_text(&err, 5), "xxxxx…");
    }

    #[test]
    fn upstream_display_names_stage() {
        let err = SessionError::upstream(Stage::Image, &anyhow::anyhow!("no output"));
        assert_eq!(err.to_string(), "image synthesis failed: no output");
    }
}
