use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Create and start a spinner with the given message.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.cyan} {msg}")
            .expect("invalid spinner template"),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

pub fn info(msg: &str) {
    println!("{msg}");
}

pub fn success(msg: &str) {
    println!("{} {msg}", "✅".green());
}

pub fn warn(msg: &str) {
    eprintln!("{} {msg}", "⚠️".yellow());
}

pub fn error(msg: &str) {
    eprintln!("{} {msg}", "❌".red());
}
