//! Cargo-style status output for devsync
//!
//! ```text
//!     Scanned 952 files (67.44 MiB)
//!    Watching ./project -> dev@build-box:/srv/project
//!      Synced 3 files (12.01 KiB) in 182ms
//! ```

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use devsync_core::PassReport;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SCANNED: &str = "Scanned";
    const CONNECTED: &str = "Connected";
    const WATCHING: &str = "Watching";
    const SYNCED: &str = "Synced";
    const FINISHED: &str = "Finished";
    const STALE: &str = "Stale";
    const LOGGING: &str = "Logging";
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

fn print_warning(status: &str, message: &str) {
    print_styled(&console::Style::new().yellow().bold(), status, message);
}

fn print_styled(style: &console::Style, status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

pub fn log_file(path: &Path) {
    print_styled(
        &console::Style::new().dim().bold(),
        Status::LOGGING,
        &path.display().to_string(),
    );
}

pub fn scanned(files: usize, bytes: u64) {
    print_status(
        Status::SCANNED,
        &format!(
            "{files} file{} ({})",
            plural(files),
            humansize::format_size(bytes, humansize::BINARY)
        ),
    );
}

pub fn connected(destination: &str) {
    print_status(Status::CONNECTED, destination);
}

pub fn watching(local: &Path, remote: &str) {
    print_status(
        Status::WATCHING,
        &format!("{} -> {remote} (Ctrl+C to stop)", local.display()),
    );
}

/// Summarize one pass. Passes with nothing to do stay quiet unless `always`.
pub fn pass(report: &PassReport, always: bool) {
    if !report.remote_refreshed {
        print_warning(Status::STALE, "remote listing failed, diffed against the last one");
    }
    let done = report.uploaded + report.linked;
    if report.failed > 0 {
        print_warning(
            Status::FINISHED,
            &format!(
                "{done} synced, {} failed in {}",
                report.failed,
                format_elapsed(report.elapsed)
            ),
        );
    } else if done > 0 || always {
        print_status(
            Status::SYNCED,
            &format!(
                "{done} file{} ({}) in {}",
                plural(done),
                humansize::format_size(report.bytes, humansize::BINARY),
                format_elapsed(report.elapsed)
            ),
        );
    }
}
