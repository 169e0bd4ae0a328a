use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::BulkError;

const RESET: &str = "\x1b[0m";
const WORKERS: usize = 4;

/// Assigned to keywords in order.
pub const PALETTE: [&str; 10] = [
    "\x1b[31m", "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m", "\x1b[91m",
    "\x1b[92m", "\x1b[93m", "\x1b[94m",
];

#[derive(Debug, Clone)]
pub struct HighlightOptions {
    pub keywords: Vec<String>,
    pub output_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HighlightFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HighlightResult {
    pub sources: usize,
    pub written: Vec<String>,
    pub failures: Vec<HighlightFailure>,
}

/// Splits `a, b ,,c` into `["a", "b", "c"]`.
pub fn parse_keywords(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|keyword| !keyword.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug)]
pub struct Highlighter {
    keywords: Vec<String>,
    pattern: Regex,
}

impl Highlighter {
    pub fn new(keywords: Vec<String>) -> Result<Self, BulkError> {
        let mut unique: Vec<String> = Vec::new();
        for keyword in keywords {
            if !keyword.is_empty() && !unique.contains(&keyword) {
                unique.push(keyword);
            }
        }
        if unique.is_empty() {
            return Err(BulkError::InvalidKeywords("no keywords given".to_string()));
        }
        if unique.len() > PALETTE.len() {
            return Err(BulkError::InvalidKeywords(format!(
                "at most {} keywords are supported, got {}",
                PALETTE.len(),
                unique.len()
            )));
        }

        // Longest first so a keyword that contains another one wins.
        let mut alternatives: Vec<&String> = unique.iter().collect();
        alternatives.sort_by_key(|keyword| std::cmp::Reverse(keyword.len()));
        let pattern = alternatives
            .iter()
            .map(|keyword| regex::escape(keyword))
            .collect::<Vec<_>>()
            .join("|");
        let pattern =
            Regex::new(&pattern).map_err(|err| BulkError::InvalidKeywords(err.to_string()))?;

        Ok(Self {
            keywords: unique,
            pattern,
        })
    }

    pub fn color_for(&self, keyword: &str) -> Option<&'static str> {
        self.keywords
            .iter()
            .position(|candidate| candidate == keyword)
            .map(|position| PALETTE[position])
    }

    pub fn highlight_text(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, |caps: &Captures<'_>| {
                let matched = &caps[0];
                match self.color_for(matched) {
                    Some(color) => format!("{color}{matched}{RESET}"),
                    None => matched.to_string(),
                }
            })
            .into_owned()
    }

    /// Highlights a plain `.json` file or every `.json` member of a zip
    /// archive. Outputs are `<name>.colored` next to the source or in
    /// `output_dir`.
    pub fn process_file(
        &self,
        source: &Utf8Path,
        output_dir: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, BulkError> {
        let target_dir = match output_dir {
            Some(dir) => dir.to_path_buf(),
            None => source
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from(".")),
        };
        fs::create_dir_all(target_dir.as_std_path())
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;

        if source.extension() == Some("json") {
            let text = fs::read_to_string(source.as_std_path())
                .map_err(|err| BulkError::Filesystem(format!("read {source}: {err}")))?;
            let name = source.file_name().unwrap_or("output.json");
            let output = target_dir.join(format!("{name}.colored"));
            self.write_highlighted(&output, &text)?;
            return Ok(vec![output]);
        }

        let file = fs::File::open(source.as_std_path())
            .map_err(|err| BulkError::Archive(format!("open zip {source}: {err}")))?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| BulkError::Archive(err.to_string()))?;
        let mut outputs = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|err| BulkError::Archive(err.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let name = match entry.enclosed_name() {
                Some(path) => member_file_name(&path)?,
                None => {
                    return Err(BulkError::Archive(
                        "zip entry path traversal detected".to_string(),
                    ));
                }
            };
            if !name.ends_with(".json") {
                continue;
            }
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|err| BulkError::Archive(format!("{source}: {name}: {err}")))?;
            let output = target_dir.join(format!("{name}.colored"));
            self.write_highlighted(&output, &text)?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Processes every archive and JSON file under `root` with a small
    /// worker pool. A failing file is recorded and does not stop the batch.
    pub fn process_tree(
        &self,
        root: &Utf8Path,
        output_dir: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<HighlightResult, BulkError> {
        let sources = collect_sources(root)?;
        sink.event(ProgressEvent {
            message: format!("phase=Highlight; {} files under {root}", sources.len()),
            elapsed: None,
        });

        let next = AtomicUsize::new(0);
        let outcomes: Mutex<Vec<(usize, Result<Vec<Utf8PathBuf>, BulkError>)>> =
            Mutex::new(Vec::with_capacity(sources.len()));
        thread::scope(|scope| {
            for _ in 0..WORKERS.min(sources.len().max(1)) {
                scope.spawn(|| {
                    loop {
                        let position = next.fetch_add(1, Ordering::Relaxed);
                        let Some(source) = sources.get(position) else {
                            break;
                        };
                        debug!(file = %source, "highlighting");
                        let outcome = self.process_file(source, output_dir);
                        outcomes
                            .lock()
                            .unwrap_or_else(|poison| poison.into_inner())
                            .push((position, outcome));
                    }
                });
            }
        });

        let mut outcomes = outcomes
            .into_inner()
            .unwrap_or_else(|poison| poison.into_inner());
        outcomes.sort_by_key(|(position, _)| *position);

        let mut result = HighlightResult {
            sources: sources.len(),
            ..HighlightResult::default()
        };
        for (position, outcome) in outcomes {
            let source = &sources[position];
            match outcome {
                Ok(outputs) => {
                    sink.event(ProgressEvent {
                        message: format!("file.highlighted {source} ({} outputs)", outputs.len()),
                        elapsed: None,
                    });
                    result
                        .written
                        .extend(outputs.into_iter().map(|path| path.to_string()));
                }
                Err(err) => {
                    warn!(file = %source, "highlight failed: {err}");
                    sink.event(ProgressEvent {
                        message: format!("file.failed {source} {err}"),
                        elapsed: None,
                    });
                    result.failures.push(HighlightFailure {
                        path: source.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    fn write_highlighted(&self, output: &Utf8Path, text: &str) -> Result<(), BulkError> {
        fs::write(output.as_std_path(), self.highlight_text(text))
            .map_err(|err| BulkError::Filesystem(format!("write {output}: {err}")))
    }
}

fn member_file_name(path: &Path) -> Result<String, BulkError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| BulkError::Archive(format!("unusable entry name {}", path.display())))
}

fn collect_sources(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BulkError> {
    let mut sources = Vec::new();
    if !root.as_std_path().is_dir() {
        return Ok(sources);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| BulkError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| BulkError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.as_std_path().is_dir() {
                stack.push(path);
            } else if path.as_str().ends_with(".json.zip") || path.extension() == Some("json") {
                sources.push(path);
            }
        }
    }
    sources.sort();
    Ok(sources)
}
