//! Small `indicatif` helpers for the CLI's optional `--wait` progress
//! display. The orchestrators themselves never touch a terminal — these are
//! used only by `main.rs` while polling a background run to completion.

use indicatif::{ProgressBar, ProgressStyle};

pub static SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:2.cyan/blue} {msg}";

pub fn new_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE).expect("invalid spinner template");
    let spinner = ProgressBar::new_spinner().with_message(message.to_string()).with_style(style);
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    spinner
}
