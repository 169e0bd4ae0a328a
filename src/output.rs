use std::io::{self, Write};

use serde::Serialize;
use tracing::debug;

use crate::app::{
    DownloadResult, InitResult, ProgressEvent, ProgressSink, StatusResult, UrlsResult,
};
use crate::highlight::HighlightResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_urls(result: &UrlsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_init(result: &InitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_highlight(result: &HighlightResult) -> io::Result<()> {
        Self::print_json(result)
    }

    /// Pretty JSON, one document per command, newline terminated.
    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, value).map_err(io::Error::other)?;
        writeln!(stdout)?;
        stdout.flush()
    }
}

/// Non-interactive runs keep stdout for the final document, so progress
/// only reaches the log.
impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        debug!(target: "openfda_bulk::progress", "{}", event.message);
    }
}
