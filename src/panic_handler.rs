//! Crash reports for panics.
//!
//! The hook prints the report to stderr and appends it to `crash.log` in the
//! data directory, so crashes of the background server can be diagnosed
//! after the fact.

use crate::config::Config;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;

const ISSUES_URL: &str = "https://github.com/Mirko-linux/ArcadiaAI-Assistant/issues";

/// Install the panic hook. Call first thing in `main`.
pub fn install() {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    panic::set_hook(Box::new(handle_panic));
}

fn crash_report_path() -> Option<PathBuf> {
    Config::data_dir().ok().map(|dir| dir.join("crash.log"))
}

fn handle_panic(info: &PanicHookInfo) {
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown".to_string());
    let message = panic_message(info.payload());
    let backtrace = std::backtrace::Backtrace::force_capture().to_string();

    let report = format_crash_report(&location, &message, &backtrace);
    eprintln!("{}", report);

    let Some(path) = crash_report_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = file.write_all(b"\n\n");
        let _ = file.write_all(report.as_bytes());
        let _ = file.flush();
        eprintln!("Crash report appended to: {}", path.display());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn format_crash_report(location: &str, message: &str, backtrace: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");

    format!(
        "==================== ARCADIA CRASH REPORT ====================
Version:  {}
Time:     {}
Thread:   {} ({:?})
Location: {}
Message:  {}

Backtrace:
{}
==============================================================
Please report this at {} with the steps that led to it.
",
        env!("CARGO_PKG_VERSION"),
        timestamp,
        thread_name,
        thread.id(),
        location,
        message,
        backtrace,
        ISSUES_URL,
    )
}
