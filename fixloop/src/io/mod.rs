//! Side-effecting adapters: settings, processes, git, hosting, model, files.

pub mod config;
pub mod git;
pub mod hosting;
pub mod llm;
pub mod process;
pub mod prompt;
pub mod repo_files;
pub mod state_store;
