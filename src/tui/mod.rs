mod help;
mod state;

use crate::config::ConsoleConfig;
use crate::engine::{ConnectionPhase, EngineCommand, EngineConfig, LiveCoordinator, LiveSnapshot};
use crate::model::{
    CheckState, ConsoleEvent, MigrationRun, MigrationState, PipelineStatus, Record, Stage,
};
use crate::orchestrator::{self, ConsoleCommand, RunTemplate};
use crate::registry::{FailedEntry, RunRegistry};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs},
    Terminal,
};
use state::{UiState, TAB_ENGINE, TAB_FAILED, TAB_HELP, TAB_RECORDS};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Handles the UI thread reads from. The thread owns the live coordinator and
/// disposes it on exit; the controller only holds a dispatcher clone.
struct UiContext {
    registry: RunRegistry,
    live: Option<LiveCoordinator>,
}

/// Everything one frame renders, read once per draw.
struct FrameData {
    runs: Vec<MigrationRun>,
    records: Vec<(Record, PipelineStatus)>,
    failed: Vec<FailedEntry>,
    live: Option<LiveSnapshot>,
}

impl UiContext {
    fn frame(&self, state: &UiState) -> FrameData {
        let runs = self.registry.runs();
        let records = runs
            .get(state.run_idx)
            .map(|r| self.registry.records_with_status(&r.id))
            .unwrap_or_default();
        let failed = if state.tab == TAB_FAILED {
            self.registry.failed_entries(state.failed_stage)
        } else {
            Vec::new()
        };
        let live = self.live.as_ref().map(LiveCoordinator::snapshot);
        FrameData {
            runs,
            records,
            failed,
            live,
        }
    }

    fn dispatcher_busy(&self) -> bool {
        self.live.as_ref().is_some_and(LiveCoordinator::command_in_flight)
    }
}

pub async fn run(cfg: ConsoleConfig) -> Result<()> {
    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ConsoleCommand>();

    let pipeline = crate::cli::build_pipeline(&cfg);
    let source = crate::cli::build_source(&cfg);
    match pipeline.open_run(
        source.as_ref(),
        "Run 1",
        &cfg.source_product,
        &cfg.target_product,
    ) {
        Ok(run) => {
            tracing::info!(run = %run.id, policies = run.total_policies, "initial run opened")
        }
        Err(e) => {
            let _ = event_tx.send(ConsoleEvent::Info(format!("Could not open a run: {e:#}")));
        }
    }

    let live = match &cfg.engine_url {
        Some(url) => Some(LiveCoordinator::create(&EngineConfig {
            base_url: url.clone(),
            command_timeout: cfg.command_timeout,
            log_cap: cfg.log_cap,
        })?),
        None => None,
    };
    let dispatcher = live.as_ref().map(|l| l.dispatcher());

    let ctx = UiContext {
        registry: pipeline.registry.clone(),
        live,
    };

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(ctx, event_rx, cmd_tx));

    let template = RunTemplate {
        source,
        source_product_id: cfg.source_product.clone(),
        target_product_id: cfg.target_product.clone(),
    };
    let res =
        orchestrator::run_controller(pipeline, template, dispatcher, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut ctx: UiContext,
    mut event_rx: UnboundedReceiver<ConsoleEvent>,
    cmd_tx: UnboundedSender<ConsoleCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        engine_configured: ctx.live.is_some(),
        ..Default::default()
    };
    let mut known_runs = ctx.registry.runs().len();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        let run_count = ctx.registry.runs().len();
        if run_count > known_runs {
            state.focus_last_run(run_count);
        } else if run_count < known_runs {
            state.forget_selection();
        }
        known_runs = run_count;

        if last_tick.elapsed() >= tick_rate {
            let frame = ctx.frame(&state);
            state.clamp(frame.runs.len(), frame.records.len());
            terminal.draw(|f| draw(f.area(), f, &state, &frame)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                let runs = ctx.registry.runs();
                let run = runs.get(state.run_idx);
                let records = run.map(|r| ctx.registry.records(&r.id)).unwrap_or_default();
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(ConsoleCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Tab) => state.next_tab(),
                    (_, KeyCode::Char('?')) => state.tab = TAB_HELP,
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == TAB_FAILED {
                            state.failed_scroll = state.failed_scroll.saturating_sub(1);
                        } else {
                            state.move_cursor(-1, records.len());
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == TAB_FAILED {
                            state.failed_scroll += 1;
                        } else {
                            state.move_cursor(1, records.len());
                        }
                    }
                    (_, KeyCode::Char('[')) => state.switch_run(-1, runs.len()),
                    (_, KeyCode::Char(']')) => state.switch_run(1, runs.len()),
                    (_, KeyCode::Char(' ')) => state.toggle_at_cursor(&records),
                    (_, KeyCode::Char('a')) => state.toggle_all(&records),
                    (_, KeyCode::Char('f')) => {
                        if state.tab == TAB_FAILED {
                            state.failed_stage = match state.failed_stage {
                                Stage::Validate => Stage::Migrate,
                                Stage::Migrate => Stage::Verify,
                                Stage::Verify => Stage::Validate,
                            };
                            state.failed_scroll = 0;
                        }
                    }
                    (_, KeyCode::Char('n')) => {
                        let _ = cmd_tx.send(ConsoleCommand::NewRun);
                    }
                    (_, KeyCode::Char(c @ ('v' | 'm' | 'y'))) => {
                        let Some(run) = run else {
                            state.info = "No run open; press n to create one".into();
                            continue;
                        };
                        let selection = state.action_selection(&records);
                        let run_id = run.id.clone();
                        let cmd = match c {
                            'v' if ctx.registry.can_validate(&run_id, &selection) => {
                                Some(ConsoleCommand::Validate { run_id, selection })
                            }
                            'm' if state.migration_running => {
                                state.info = "A migration is already running".into();
                                None
                            }
                            'm' if ctx.registry.can_migrate(&run_id, &selection) => {
                                Some(ConsoleCommand::Migrate { run_id, selection })
                            }
                            'y' if ctx.registry.can_verify(&run_id, &selection) => {
                                Some(ConsoleCommand::Verify { run_id, selection })
                            }
                            'v' => {
                                state.info = "Nothing pending validation in selection".into();
                                None
                            }
                            'm' => {
                                state.info =
                                    "Selection must be validated and not yet migrated".into();
                                None
                            }
                            _ => {
                                state.info =
                                    "Selection must be migrated successfully first".into();
                                None
                            }
                        };
                        if let Some(cmd) = cmd {
                            let _ = cmd_tx.send(cmd);
                        }
                    }
                    (_, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(ConsoleCommand::CancelMigration);
                    }
                    (_, KeyCode::Char('x')) => match run {
                        Some(run) => {
                            let _ = cmd_tx.send(ConsoleCommand::DiscardRun {
                                run_id: run.id.clone(),
                            });
                        }
                        None => state.info = "No run to discard".into(),
                    },
                    (_, KeyCode::Char(c @ ('p' | 'u' | 's' | 'R'))) => {
                        let command = match c {
                            'p' => EngineCommand::Pause,
                            'u' => EngineCommand::Resume,
                            's' => EngineCommand::Stop,
                            _ => EngineCommand::Restart,
                        };
                        if !state.engine_configured {
                            state.info = "No engine configured (--engine-url)".into();
                        } else if state.command_allowed(ctx.dispatcher_busy()) {
                            state.pending_command = Some(command);
                            state.info = format!("Sending {command}…");
                            let _ = cmd_tx.send(ConsoleCommand::Engine(command));
                        } else {
                            state.info =
                                "Wait for the previous engine command to finish".into();
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    if let Some(live) = ctx.live.as_mut() {
        live.dispose();
    }
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, frame: &FrameData) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Records"),
        Line::from("Failed"),
        Line::from("Engine"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("policy-migration-console"),
    )
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_RECORDS => draw_records(chunks[1], f, state, frame),
        TAB_FAILED => draw_failed(chunks[1], f, state, frame),
        TAB_ENGINE => draw_engine(chunks[1], f, state, frame),
        _ => help::draw_help(chunks[1], f),
    }

    draw_status_bar(chunks[2], f, state, frame);
}

fn connection_span(live: Option<&LiveSnapshot>) -> Span<'static> {
    match live {
        None => Span::styled("Engine: none", Style::default().fg(Color::Gray)),
        Some(l) if l.live_connected => {
            Span::styled("Engine: live", Style::default().fg(Color::Green))
        }
        Some(_) => Span::styled("Not connected", Style::default().fg(Color::Red)),
    }
}

fn draw_status_bar(area: Rect, f: &mut ratatui::Frame, state: &UiState, frame: &FrameData) {
    let mut spans = vec![connection_span(frame.live.as_ref()), Span::raw(" | ")];
    if let Some(cmd) = state.pending_command {
        spans.push(Span::styled(
            format!("{cmd} in flight"),
            Style::default().fg(Color::Yellow),
        ));
        spans.push(Span::raw(" | "));
    }
    spans.push(Span::raw(state.info.clone()));
    let p = Paragraph::new(vec![Line::from(spans)]).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}

fn check_span(state: CheckState) -> Span<'static> {
    match state {
        CheckState::Pending => Span::styled("pending", Style::default().fg(Color::Gray)),
        CheckState::Pass => Span::styled("pass   ", Style::default().fg(Color::Green)),
        CheckState::Fail => Span::styled("fail   ", Style::default().fg(Color::Red)),
    }
}

fn migration_span(state: MigrationState) -> Span<'static> {
    match state {
        MigrationState::Pending => Span::styled("pending  ", Style::default().fg(Color::Gray)),
        MigrationState::Migrating => Span::styled("migrating", Style::default().fg(Color::Yellow)),
        MigrationState::Success => Span::styled("success  ", Style::default().fg(Color::Green)),
        MigrationState::Failed => Span::styled("failed   ", Style::default().fg(Color::Red)),
    }
}

fn draw_activity(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let max_lines = (area.height as usize).saturating_sub(2);
    let lines: Vec<Line> = if state.activity.is_empty() {
        vec![Line::from(Span::styled(
            "Nothing yet",
            Style::default().fg(Color::Gray),
        ))]
    } else {
        state
            .activity
            .iter()
            .take(max_lines)
            .map(|msg| Line::from(msg.as_str()))
            .collect()
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Activity"));
    f.render_widget(p, area);
}

fn draw_records(area: Rect, f: &mut ratatui::Frame, state: &UiState, frame: &FrameData) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(7)])
        .split(area);
    draw_activity(chunks[1], f, state);
    let area = chunks[0];

    let mut lines: Vec<Line> = Vec::new();
    let Some(run) = frame.runs.get(state.run_idx) else {
        lines.push(Line::from("No runs yet. Press n to open one."));
        let block = Block::default().borders(Borders::ALL).title("Records");
        f.render_widget(Paragraph::new(lines).block(block), area);
        return;
    };

    lines.push(Line::from(vec![
        Span::styled(
            format!("{} ", run.name),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "({}/{}) {} -> {}  ",
            state.run_idx + 1,
            frame.runs.len(),
            run.source_product_id,
            run.target_product_id
        )),
        Span::styled(run.status.label(), Style::default().fg(Color::Cyan)),
    ]));
    lines.push(Line::from(format!(
        "Policies {}  migrated {}  failed {}  in progress {}  selected {}",
        run.total_policies,
        run.migrated_count,
        run.failed_count,
        run.in_progress_count,
        state.selected.len()
    )));
    lines.push(Line::from(Span::styled(
        format!(
            "     {:<16} {:<14} {:<22} {:<8} {:<10} {:<8}",
            "id", "policy", "customer", "valid", "migration", "verify"
        ),
        Style::default().fg(Color::Gray),
    )));

    // Borders plus the three header lines.
    let max_items = (area.height as usize).saturating_sub(5).max(1);
    let offset = if state.cursor >= max_items {
        state.cursor + 1 - max_items
    } else {
        0
    };

    let visible = frame.records.iter().enumerate().skip(offset).take(max_items);
    for (idx, (record, status)) in visible {
        let is_cursor = idx == state.cursor;
        let mark = if state.selected.contains(&record.id) {
            "[x]"
        } else {
            "[ ]"
        };
        let row_style = if is_cursor {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!(
                    "{}{} {:<16} {:<14} {:<22} ",
                    if is_cursor { ">" } else { " " },
                    mark,
                    truncate(&record.id, 16),
                    truncate(&record.policy_number, 14),
                    truncate(&record.customer_name, 22)
                ),
                row_style,
            ),
            check_span(status.validation),
            Span::raw("  "),
            migration_span(status.migration),
            Span::raw("  "),
            check_span(status.verification),
        ]));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(
        "Records - space: select, v: validate, m: migrate, y: verify, [/]: run, x: discard",
    ));
    f.render_widget(p, area);
}

fn draw_failed(area: Rect, f: &mut ratatui::Frame, state: &UiState, frame: &FrameData) {
    let title = match state.failed_stage {
        Stage::Validate => "Failed validation",
        Stage::Migrate => "Failed migration",
        Stage::Verify => "Failed verification",
    };
    let mut lines: Vec<Line> = vec![Line::from(vec![
        Span::raw(format!("{title} across all runs: {}  ", frame.failed.len())),
        Span::styled("f", Style::default().fg(Color::Magenta)),
        Span::raw(": switch stage"),
    ])];
    lines.push(Line::from(""));

    if frame.failed.is_empty() {
        lines.push(Line::from("Nothing has failed."));
    }
    let mut body: Vec<Line> = Vec::new();
    for entry in &frame.failed {
        body.push(Line::from(vec![
            Span::styled(
                format!("{} ", entry.record.id),
                Style::default().fg(Color::Red),
            ),
            Span::raw(format!(
                "{} {}  [{}]",
                entry.record.policy_number, entry.record.customer_name, entry.run.name
            )),
        ]));
        if entry.errors.is_empty() {
            body.push(Line::from("    (no details)"));
        }
        for err in &entry.errors {
            body.push(Line::from(format!("    - {err}")));
        }
    }
    let scroll = state.failed_scroll.min(body.len().saturating_sub(1));
    lines.extend(body.into_iter().skip(scroll));

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn phase_span(label: &'static str, phase: ConnectionPhase) -> Vec<Span<'static>> {
    let (text, color) = match phase {
        ConnectionPhase::Connected => ("connected", Color::Green),
        ConnectionPhase::Connecting => ("connecting", Color::Yellow),
        ConnectionPhase::Disconnected => ("disconnected", Color::Red),
    };
    vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::styled(text, Style::default().fg(color)),
        Span::raw("  "),
    ]
}

fn draw_engine(area: Rect, f: &mut ratatui::Frame, state: &UiState, frame: &FrameData) {
    let Some(live) = frame.live.as_ref() else {
        let p = Paragraph::new(vec![
            Line::from("No engine configured."),
            Line::from("Start with --engine-url <url> to mirror a running migration engine."),
        ])
        .block(Block::default().borders(Borders::ALL).title("Engine"));
        f.render_widget(p, area);
        return;
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(9),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let mut conn = phase_span("status", live.status_phase);
    conn.extend(phase_span("stats", live.stats_phase));
    conn.extend(phase_span("logs", live.logs_phase));

    let mut lines = vec![Line::from(conn)];
    if !live.live_connected {
        lines.push(Line::from(Span::styled(
            "Not connected",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
    }
    match &live.status {
        Some(s) => {
            lines.push(Line::from(format!("State: {}   Next: {}", s.state, s.next_task)));
            lines.push(Line::from(format!(
                "Elapsed: {}   Estimated: {}",
                s.elapsed, s.estimated
            )));
            lines.push(Line::from(format!("Latest: {}", s.latest_status)));
        }
        None => lines.push(Line::from("Waiting for the first status update…")),
    }
    if let Some(st) = &live.stats {
        lines.push(Line::from(format!(
            "Records {}/{}   success {}   errors {}",
            st.processed_records, st.total_records, st.success_count, st.error_count
        )));
    }
    if let Some(err) = &live.last_error {
        lines.push(Line::from(Span::styled(
            format!("Last error: {err}"),
            Style::default().fg(Color::Red),
        )));
    }
    let cmd_line = if live.command_in_flight || state.pending_command.is_some() {
        Span::styled(
            "Command in flight; controls disabled",
            Style::default().fg(Color::Yellow),
        )
    } else {
        Span::raw("p pause  u resume  s stop  R restart")
    };
    lines.push(Line::from(cmd_line));
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Engine"));
    f.render_widget(p, chunks[0]);

    let progress = live
        .status
        .as_ref()
        .map(|s| progress_ratio(s.progress))
        .unwrap_or(0.0);
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(progress);
    f.render_widget(gauge, chunks[1]);

    let max_logs = (chunks[2].height as usize).saturating_sub(2);
    let log_lines: Vec<Line> = if live.logs.is_empty() {
        vec![Line::from("No log entries yet")]
    } else {
        live.logs
            .iter()
            .take(max_logs)
            .map(|e| Line::from(e.to_line()))
            .collect()
    };
    let logs = Paragraph::new(log_lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Logs ({})", live.logs.len())),
    );
    f.render_widget(logs, chunks[2]);
}

/// The engine reports progress either as a fraction or as a percentage.
fn progress_ratio(progress: f64) -> f64 {
    let ratio = if progress > 1.0 { progress / 100.0 } else { progress };
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
