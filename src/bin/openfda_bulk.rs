use std::io::IsTerminal;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use openfda_bulk::app::{
    ALL_URLS_FILE, App, DownloadOptions, DownloadResult, MISSING_FILES_FILE, PeriodSelection,
    ProgressSinkKind, StatusResult,
};
use openfda_bulk::clock::SystemClock;
use openfda_bulk::config::{ConfigLoader, ResolvedConfig, validate_settings};
use openfda_bulk::domain::Period;
use openfda_bulk::error::BulkError;
use openfda_bulk::fetcher::FdaHttpClient;
use openfda_bulk::highlight::{HighlightOptions, HighlightResult, parse_keywords};
use openfda_bulk::output::{JsonOutput, OutputMode};
use openfda_bulk::tui::Tui;

#[derive(Parser)]
#[command(name = "openfda-bulk")]
#[command(about = "Resumable bulk downloader for the openFDA drug adverse event archive")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    base_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    base_url: Option<String>,

    #[arg(long, global = true)]
    group_size: Option<usize>,

    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[arg(long, global = true)]
    max_group_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download every missing archive of the selected periods")]
    Download(DownloadArgs),
    #[command(about = "Download only the URLs listed in the work list")]
    Resume(ResumeArgs),
    #[command(about = "Report which archives are present on disk")]
    Status(StatusArgs),
    #[command(about = "Write every catalog URL to a file")]
    Urls(UrlsArgs),
    #[command(about = "Create the year/quarter directory tree")]
    Init(RangeArgs),
    #[command(about = "Write keyword-highlighted copies of the downloaded JSON")]
    Highlight(HighlightArgs),
}

#[derive(Args, Clone, Default)]
struct RangeArgs {
    #[arg(long)]
    from: Option<Period>,

    #[arg(long)]
    to: Option<Period>,

    #[arg(long = "period")]
    periods: Vec<Period>,
}

impl RangeArgs {
    fn selection(&self) -> PeriodSelection {
        PeriodSelection {
            from: self.from,
            to: self.to,
            only: self.periods.clone(),
        }
    }
}

#[derive(Args, Clone)]
struct DownloadArgs {
    #[command(flatten)]
    range: RangeArgs,

    #[arg(long, default_value = MISSING_FILES_FILE)]
    work_list: Utf8PathBuf,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct ResumeArgs {
    #[arg(long, default_value = MISSING_FILES_FILE)]
    work_list: Utf8PathBuf,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct StatusArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Write the missing URLs to this work list
    #[arg(long, num_args = 0..=1, default_missing_value = MISSING_FILES_FILE)]
    write_missing: Option<Utf8PathBuf>,
}

#[derive(Args, Clone)]
struct UrlsArgs {
    #[command(flatten)]
    range: RangeArgs,

    #[arg(long, default_value = ALL_URLS_FILE)]
    output: Utf8PathBuf,
}

#[derive(Args, Clone)]
struct HighlightArgs {
    /// Comma separated, at most 10
    #[arg(long)]
    keywords: String,

    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<BulkError>() {
                return ExitCode::from(err.exit_code());
            }
            ExitCode::from(1)
        }
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive || !std::io::stdout().is_terminal() {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = resolve_config(&cli)?;
    let store = config.store()?;
    let catalog = config.catalog(store);
    let client = FdaHttpClient::new(config.request_timeout)?;
    let app = App::new(catalog, client, SystemClock, config.settings.clone());

    match cli.command {
        Commands::Download(args) => {
            let selection = args.range.selection();
            let options = DownloadOptions {
                dry_run: args.dry_run,
                work_list: args.work_list,
            };
            let result = match output_mode {
                OutputMode::Interactive if !options.dry_run => {
                    let mut tui = Tui::new(ProgressSinkKind::Download);
                    tui.run(move |sink| app.download(&selection, &options, sink))?
                }
                _ => app.download(&selection, &options, &JsonOutput)?,
            };
            finish_download(&result, output_mode)
        }
        Commands::Resume(args) => {
            let options = DownloadOptions {
                dry_run: args.dry_run,
                work_list: args.work_list,
            };
            let result = match output_mode {
                OutputMode::Interactive if !options.dry_run => {
                    let mut tui = Tui::new(ProgressSinkKind::Resume);
                    tui.run(move |sink| app.resume(&options, sink))?
                }
                _ => app.resume(&options, &JsonOutput)?,
            };
            finish_download(&result, output_mode)
        }
        Commands::Status(args) => {
            let result = app.status(
                &args.range.selection(),
                args.write_missing.as_deref(),
                &JsonOutput,
            )?;
            match output_mode {
                OutputMode::Interactive => print_status_summary(&result),
                OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic()?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Urls(args) => {
            let result = app.urls(&args.range.selection(), &args.output)?;
            match output_mode {
                OutputMode::Interactive => {
                    println!("Generated {} URLs and saved to {}", result.count, result.path)
                }
                OutputMode::NonInteractive => JsonOutput::print_urls(&result).into_diagnostic()?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init(args) => {
            let result = app.init(&args.selection())?;
            match output_mode {
                OutputMode::Interactive => {
                    for dir in &result.created {
                        println!("Created {dir}");
                    }
                    println!("Directory structure ready under {}", result.base_dir);
                }
                OutputMode::NonInteractive => JsonOutput::print_init(&result).into_diagnostic()?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Highlight(args) => {
            let options = HighlightOptions {
                keywords: parse_keywords(&args.keywords),
                output_dir: args.output_dir,
            };
            let result = match output_mode {
                OutputMode::Interactive => {
                    let mut tui = Tui::new(ProgressSinkKind::Highlight);
                    tui.run(move |sink| app.highlight(&options, sink))?
                }
                OutputMode::NonInteractive => app.highlight(&options, &JsonOutput)?,
            };
            match output_mode {
                OutputMode::Interactive => print_highlight_summary(&result),
                OutputMode::NonInteractive => {
                    JsonOutput::print_highlight(&result).into_diagnostic()?
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<ResolvedConfig, BulkError> {
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = &cli.base_dir {
        config.base_dir = Some(dir.clone());
    }
    if let Some(url) = &cli.base_url {
        config.base_url = url.clone();
    }
    if let Some(size) = cli.group_size {
        config.settings.group_size = size;
    }
    if let Some(attempts) = cli.max_attempts {
        config.settings.max_attempts = attempts;
    }
    if let Some(retries) = cli.max_group_retries {
        config.settings.max_group_retries = retries;
    }
    validate_settings(&config.settings)?;
    Ok(config)
}

fn finish_download(result: &DownloadResult, output_mode: OutputMode) -> miette::Result<ExitCode> {
    match output_mode {
        OutputMode::Interactive => print_download_summary(result),
        OutputMode::NonInteractive => JsonOutput::print_download(result).into_diagnostic()?,
    }
    let code = result.exit_code();
    if code == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        let failed: Vec<String> = result
            .failed_periods()
            .iter()
            .map(Period::to_string)
            .collect();
        eprintln!("failed periods: {}", failed.join(", "));
        Ok(ExitCode::from(code))
    }
}

fn print_download_summary(result: &DownloadResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}openfda-bulk summary{reset}");
    if result.dry_run {
        println!(
            "{yellow}dry run: {} of {} planned files would be fetched{reset}",
            result.would_fetch.len(),
            result.planned
        );
        for url in &result.would_fetch {
            println!("  {url}");
        }
        return;
    }

    let Some(report) = &result.report else {
        return;
    };
    println!(
        "{green}fetched {} files in {} requests{reset}",
        report.files_fetched(),
        report.attempts()
    );
    for period in &report.periods {
        if period.is_failed() {
            println!(
                "{red}x {} {} of {} files missing{reset}",
                period.period, period.missing, period.planned
            );
        } else {
            println!("{green}+ {} complete ({} files){reset}", period.period, period.planned);
        }
    }
    if report.missing.is_empty() {
        println!("{green}nothing missing{reset}");
    } else {
        println!(
            "{yellow}{} files still missing, listed in {}{reset}",
            report.missing.len(),
            result.work_list
        );
    }
}

fn print_status_summary(result: &StatusResult) {
    let status = &result.status;
    println!("File Status Summary ({})", result.base_dir);
    println!("Total Files: {}", status.total_files);
    println!("Missing Files: {}", status.missing_count);
    let mut year = None;
    for period in &status.periods {
        if year != Some(period.period.year) {
            year = Some(period.period.year);
            println!("\nYear {}:", period.period.year);
        }
        println!(
            "  {}: {}/{} files downloaded",
            period.period.quarter.as_str().to_uppercase(),
            period.downloaded,
            period.total
        );
    }
    if let Some(path) = &result.work_list {
        println!("\nMissing files have been logged to {path}");
    }
}

fn print_highlight_summary(result: &HighlightResult) {
    println!(
        "Highlighted {} files into {} outputs",
        result.sources - result.failures.len(),
        result.written.len()
    );
    for failure in &result.failures {
        eprintln!("error processing {}: {}", failure.path, failure.error);
    }
}
