// rave-cli: clap command tree and human-facing output for the rave tool.

mod commands;
mod ui;

pub use commands::run;
