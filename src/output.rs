use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BankStatus, RunReport};
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress stays in the log stream; stdout carries only the final JSON.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn print_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}kira-mirror {} run: {}{reset}", mode_label(report), report.status);
    for bank in &report.banks {
        let color = match bank.status {
            BankStatus::Ok => green,
            BankStatus::Skipped => yellow,
            BankStatus::Error | BankStatus::Aborted => red,
        };
        println!(
            "{color}{:<24} {:?}{}{reset}",
            bank.name,
            bank.status,
            bank.message
                .as_deref()
                .map(|message| format!(" ({message})"))
                .unwrap_or_default()
        );
        if let Some(listed) = bank.listed {
            println!("   listed: {listed}");
        }
        if let Some(pool) = &bank.pool {
            println!(
                "   downloaded: {}, up to date: {}, failed: {}",
                pool.downloaded,
                pool.skipped,
                pool.failed.len()
            );
        }
        if let Some(path) = &bank.info_output {
            println!("   listing: {path}");
        }
        if let Some(install) = &bank.install {
            println!("   installed: {} ({} files)", install.current, install.files);
        }
    }
}

fn mode_label(report: &RunReport) -> &'static str {
    match report.mode {
        crate::domain::RunMode::Download => "download",
        crate::domain::RunMode::Info => "info",
    }
}
