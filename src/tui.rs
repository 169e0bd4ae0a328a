use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::BulkError;

const EVENTS_MAX: usize = 8;
const FRAME: Duration = Duration::from_millis(120);
/// The work list is only rewritten when a run ends, so a detached run
/// leaves the previous one in place.
const DETACHED: &str = "aborted; files already on disk are kept. The work list was not updated: \
run `openfda-bulk status --write-missing` to refresh it, then `resume`";

type Backend = CrosstermBackend<io::Stdout>;
const LOGS_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Plan,
    Dispatch,
    Verify,
    Highlight,
    Report,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Plan => "Plan",
            Phase::Dispatch => "Dispatch",
            Phase::Verify => "Verify",
            Phase::Highlight => "Highlight",
            Phase::Report => "Report",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    files_fetched: u64,
    files_failed: u64,
    attempts: u64,
    groups_complete: u64,
    group_retries: u64,
    periods_complete: u64,
    periods_failed: u64,
}

#[derive(Debug)]
struct DashboardState {
    status: String,
    phase: Phase,
    current_period: Option<String>,
    counters: Counters,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<DashboardState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            apply_event(&mut state, &message);
            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            push_bounded(
                &mut state.logs,
                format!("[{}] {message}", Local::now().format("%H:%M:%S")),
                LOGS_MAX,
            );
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(DashboardState {
                status: "ready".to_string(),
                phase: Phase::Plan,
                current_period: None,
                counters: Counters::default(),
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                started: Instant::now(),
            })),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a worker thread while drawing its progress. Returns when
    /// the worker finishes; `q` detaches the dashboard and reports an abort.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, BulkError> + Send + 'static,
        R: Send + 'static,
    {
        let sink = TuiProgress {
            state: Arc::clone(&self.state),
        };
        let worker = thread::Builder::new()
            .name("openfda-run".to_string())
            .spawn(move || f(&sink))
            .into_diagnostic()?;

        let mut terminal = enter_terminal()?;
        let mut tick = 0usize;
        let detached = loop {
            if worker.is_finished() {
                break false;
            }
            if let Err(err) = self.redraw(&mut terminal, tick) {
                restore_terminal()?;
                return Err(err);
            }
            if event::poll(FRAME).into_diagnostic()?
                && let Event::Key(key) = event::read().into_diagnostic()?
                && self.handle_key(key)
            {
                break true;
            }
            tick = tick.wrapping_add(1);
        };
        restore_terminal()?;

        if detached {
            return Err(miette::Report::msg(DETACHED));
        }
        match worker.join() {
            Ok(result) => result.map_err(miette::Report::new),
            Err(_) => Err(miette::Report::msg("run thread panicked")),
        }
    }

    fn redraw(&self, terminal: &mut Terminal<Backend>, tick: usize) -> miette::Result<()> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let elapsed = state.started.elapsed();
        terminal
            .draw(|frame| draw_ui(frame, self, &state, tick, elapsed))
            .into_diagnostic()?;
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => true,
            KeyCode::F(4) | KeyCode::Char('l') => {
                if let Ok(mut state) = self.state.lock() {
                    state.view = match state.view {
                        View::Operational => View::Logs,
                        View::Logs => View::Operational,
                    };
                }
                false
            }
            KeyCode::Up => {
                self.log_scroll = self.log_scroll.saturating_add(1);
                false
            }
            KeyCode::Down => {
                self.log_scroll = self.log_scroll.saturating_sub(1);
                false
            }
            _ => false,
        }
    }
}

fn enter_terminal() -> miette::Result<Terminal<Backend>> {
    enable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(EnterAlternateScreen)
        .into_diagnostic()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout())).into_diagnostic()?;
    terminal.clear().into_diagnostic()?;
    Ok(terminal)
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn apply_event(state: &mut DashboardState, message: &str) {
    if let Some((phase, payload)) = parse_phase(message) {
        state.phase = phase;
        state.status = payload.to_string();
        return;
    }
    let (kind, rest) = message.split_once(' ').unwrap_or((message, ""));
    let counters = &mut state.counters;
    match kind {
        "period.start" => {
            state.current_period = rest.split_whitespace().next().map(str::to_string);
        }
        "period.complete" => counters.periods_complete += 1,
        "period.failed" => counters.periods_failed += 1,
        "group.complete" | "group.present" => counters.groups_complete += 1,
        "group.retry" => counters.group_retries += 1,
        "file.fetched" | "file.highlighted" => counters.files_fetched += 1,
        "file.failed" => counters.files_failed += 1,
        _ => {}
    }
    if kind.starts_with("file.") {
        counters.attempts += parse_attempts(rest);
    }
    state.status = message.to_string();
}

/// `attempts=N` anywhere in the payload; highlight events carry none.
fn parse_attempts(payload: &str) -> u64 {
    payload
        .split_whitespace()
        .find_map(|token| token.strip_prefix("attempts="))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Plan" => Phase::Plan,
        "Dispatch" => Phase::Dispatch,
        "Verify" => Phase::Verify,
        "Highlight" => Phase::Highlight,
        "Report" => Phase::Report,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn draw_ui(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    state: &DashboardState,
    tick: usize,
    elapsed: Duration,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui.kind, tick), chunks[0]);

    match state.view {
        View::Operational => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(chunks[1]);
            frame.render_widget(draw_status_panel(state, elapsed), main[0]);
            frame.render_widget(draw_counters_panel(state), main[1]);
        }
        View::Logs => {
            frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]);
        }
    }

    let footer = Paragraph::new(Line::from(muted(
        "q: detach   l/F4: toggle logs   ↑/↓: scroll logs",
    )))
    .block(Block::default().borders(Borders::TOP));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(kind: ProgressSinkKind, tick: usize) -> Paragraph<'static> {
    let pulse = if tick % 2 == 0 { "*" } else { " " };
    let operation = match kind {
        ProgressSinkKind::Download => "download",
        ProgressSinkKind::Resume => "resume",
        ProgressSinkKind::Highlight => "highlight",
    };
    Paragraph::new(Line::from(vec![
        heading("OPENFDA-BULK"),
        Span::styled(
            format!(" v{}  ", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(operation, Style::default().fg(Color::Cyan)),
        Span::styled(
            format!("  {}  ", Local::now().format("%H:%M:%S")),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(pulse, Style::default().fg(Color::Green)),
    ]))
    .alignment(Alignment::Left)
    .block(Block::default().borders(Borders::BOTTOM))
}

fn muted(text: &'static str) -> Span<'static> {
    Span::styled(text, Style::default().fg(Color::Gray))
}

fn heading(text: &'static str) -> Span<'static> {
    Span::styled(
        text,
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )
}

fn draw_status_panel(state: &DashboardState, elapsed: Duration) -> Paragraph<'static> {
    let phase_color = if state.phase == Phase::Report {
        Color::Green
    } else {
        Color::Cyan
    };
    let mut lines = vec![
        Line::from(heading("STATUS")),
        Line::from(vec![
            muted("Phase: "),
            Span::styled(state.phase.label(), Style::default().fg(phase_color)),
            muted("   Elapsed: "),
            Span::raw(format!("{}s", elapsed.as_secs())),
        ]),
        Line::from(vec![
            muted("Period: "),
            Span::raw(
                state
                    .current_period
                    .clone()
                    .unwrap_or_else(|| "--".to_string()),
            ),
        ]),
        Line::from(vec![
            muted("Now: "),
            Span::raw(state.status.clone()),
        ]),
        Line::from(muted("Recent events:")),
    ];
    for event in state.events.iter().rev().take(EVENTS_MAX) {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_counters_panel(state: &DashboardState) -> Paragraph<'static> {
    let counters = &state.counters;
    let row = |label: &'static str, value: u64, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<18}"), Style::default().fg(Color::Gray)),
            Span::styled(value.to_string(), Style::default().fg(color)),
        ])
    };
    let failed_color = if counters.periods_failed > 0 {
        Color::Red
    } else {
        Color::Green
    };
    Paragraph::new(vec![
        Line::from(heading("COUNTERS")),
        row("Files done", counters.files_fetched, Color::Green),
        row("Files failed", counters.files_failed, Color::Yellow),
        row("Requests", counters.attempts, Color::Cyan),
        row("Groups complete", counters.groups_complete, Color::Green),
        row("Group retries", counters.group_retries, Color::Yellow),
        row("Periods complete", counters.periods_complete, Color::Green),
        row("Periods failed", counters.periods_failed, failed_color),
    ])
    .wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &DashboardState, scroll: u16) -> Paragraph<'static> {
    let lines: Vec<Line<'static>> = state
        .logs
        .iter()
        .rev()
        .skip(scroll as usize)
        .map(|line| Line::from(line.clone()))
        .collect();
    Paragraph::new(lines)
        .block(Block::default().title("LOGS").borders(Borders::NONE))
        .wrap(Wrap { trim: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DashboardState {
        DashboardState {
            status: String::new(),
            phase: Phase::Plan,
            current_period: None,
            counters: Counters::default(),
            events: VecDeque::new(),
            logs: VecDeque::new(),
            view: View::Operational,
            started: Instant::now(),
        }
    }

    #[test]
    fn detach_message_points_at_work_list_refresh() {
        assert!(DETACHED.contains("status --write-missing"));
        assert!(DETACHED.contains("work list was not updated"));
    }

    #[test]
    fn events_update_phase_and_counters() {
        let mut state = state();
        apply_event(&mut state, "period.start 2014q1 (20 files)");
        apply_event(&mut state, "phase=Dispatch; 2014q1 group 1 (3 files, cycle 1/3)");
        apply_event(&mut state, "file.fetched drug-event-0001-of-0020.json.zip attempts=1");
        apply_event(&mut state, "group.retry 2014q1 group 1 after 300s wait (11 polls)");
        apply_event(&mut state, "period.failed 2014q1 at group 1, 19 files missing");

        assert_eq!(state.phase, Phase::Dispatch);
        assert_eq!(state.current_period.as_deref(), Some("2014q1"));
        assert_eq!(state.counters.files_fetched, 1);
        assert_eq!(state.counters.attempts, 1);
        assert_eq!(state.counters.group_retries, 1);
        assert_eq!(state.counters.periods_failed, 1);
    }

    #[test]
    fn unknown_phase_is_plain_status() {
        assert!(parse_phase("phase=Bogus; x").is_none());
        assert_eq!(
            parse_phase("phase=Verify; 2014q1 group 2"),
            Some((Phase::Verify, "2014q1 group 2"))
        );
    }
}
