pub mod events;
pub mod history;
pub mod paths;
pub mod prompts;
