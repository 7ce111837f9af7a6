//! Generation session core: one live session, one background worker, and
//! the expander/synthesizer seams the worker drives.

mod controller;
mod error;
mod expander;
mod session;
mod synthesizer;
pub mod worker;

pub use controller::{
    Collaborators, SessionController, SessionOptions, StartOutcome, StartRequest,
};
pub use error::{Result, SessionError, Stage};
pub use expander::{
    parse_prompt_pair, DryrunExpander, OllamaExpander, OpenAiExpander, PromptExpander,
};
pub use session::{SessionSnapshot, SessionState, DEFAULT_COUNT, DEFAULT_HEIGHT, DEFAULT_WIDTH};
pub use synthesizer::{
    ComfyUiConfig, ComfyUiSynthesizer, DryrunSynthesizer, ImageSynthesizer, SynthesisRequest,
};
