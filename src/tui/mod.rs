mod help;
mod state;

use crate::cli::{build_settings, Cli};
use crate::model::{
    ConnectionQuality, ConnectionStatus, EngineEvent, OperationKind, Severity, ToolCapabilities,
    APPS_ROOT,
};
use crate::orchestrator::{self, OperationCoordinator, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::Color,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Tabs},
    Terminal,
};
use state::{apply_event, InputField, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli, caps: ToolCapabilities) -> Result<()> {
    // Unbounded channels keep the controller from ever waiting on the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let coordinator = OperationCoordinator::new(caps, build_settings(&args), event_tx.clone());
    coordinator.announce_capabilities();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(coordinator, event_tx, cmd_rx).await;

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
pub fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<EngineEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::from_args(&args);
    if let Some(path) = args.log_file.clone().or_else(crate::logging::default_log_path) {
        state.info = format!("Logging to {}. Press ? for help.", path.display());
    }
    if !state.filter.is_empty() {
        let _ = cmd_tx.send(UiCommand::SetFilter(state.filter.clone()));
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
                if let Some(field) = state.editing {
                    handle_edit_key(&mut state, field, k, &cmd_tx);
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('c')) => match state.connect_command() {
                        Ok(cmd) => {
                            let _ = cmd_tx.send(cmd);
                        }
                        Err(msg) => state.info = msg,
                    },
                    (_, KeyCode::Char('d')) => {
                        let _ = cmd_tx.send(UiCommand::Disconnect);
                    }
                    (_, KeyCode::Char('l')) => {
                        let _ = cmd_tx.send(UiCommand::ListBundles);
                    }
                    (_, KeyCode::Char('r')) => match state.run_command() {
                        Ok(cmd) => {
                            state.progress = None;
                            let _ = cmd_tx.send(cmd);
                        }
                        Err(msg) => state.info = msg,
                    },
                    (_, KeyCode::Char('t')) => {
                        let _ = cmd_tx.send(state.transfer_command());
                    }
                    (_, KeyCode::Char('x')) => match state.execute_command() {
                        Ok(cmd) => {
                            let _ = cmd_tx.send(cmd);
                        }
                        Err(msg) => state.info = msg,
                    },
                    (_, KeyCode::Char('g')) => {
                        let _ = cmd_tx.send(UiCommand::Download { save_path: None });
                    }
                    (_, KeyCode::Char('m')) => state.toggle_mechanism(),
                    (_, KeyCode::Char('v')) => {
                        state.verbose = !state.verbose;
                        let _ = cmd_tx.send(UiCommand::SetVerbose(state.verbose));
                    }
                    (_, KeyCode::Char('i')) => {
                        state.tab = 0;
                        state.begin_editing();
                    }
                    (_, KeyCode::Char('/')) => {
                        state.tab = 0;
                        state.editing = Some(InputField::Filter);
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => state.select_prev(),
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => state.select_next(),
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 2;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 1;
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn handle_edit_key(
    state: &mut UiState,
    field: InputField,
    k: KeyEvent,
    cmd_tx: &UnboundedSender<UiCommand>,
) {
    let mut changed = false;
    match k.code {
        KeyCode::Esc | KeyCode::Enter => state.editing = None,
        KeyCode::Tab => state.cycle_field(true),
        KeyCode::BackTab => state.cycle_field(false),
        KeyCode::Backspace => {
            changed = state.field_mut(field).pop().is_some();
        }
        KeyCode::Char(c) if !k.modifiers.contains(KeyModifiers::CONTROL) => {
            state.field_mut(field).push(c);
            changed = true;
        }
        _ => {}
    }
    if changed && field == InputField::Filter {
        let _ = cmd_tx.send(UiCommand::SetFilter(state.filter.clone()));
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Extract"), Line::from("Help")])
        .select(state.tab)
        .block(Block::default().borders(Borders::ALL).title("ipa-extract"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_main(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
    draw_footer(chunks[2], f, state);
}

fn draw_main(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(8), // Connection inputs + status
            Constraint::Length(8), // Script + tools
            Constraint::Min(0),    // Bundles
        ])
        .split(cols[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(cols[1]);

    draw_connection(left[0], f, state);
    draw_script(left[1], f, state);
    draw_bundles(left[2], f, state);
    draw_log(right[0], f, state);
    draw_progress(right[1], f, state);
}

fn field_line(state: &UiState, field: InputField, value: &str) -> Line<'static> {
    let editing = state.editing == Some(field);
    let locked = !field.editable(state.is_connected());
    let value_style = if editing {
        Style::default().fg(Color::Yellow)
    } else if locked {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };
    let mut spans = vec![
        Span::styled(format!("{}: ", field.label()), Style::default().fg(Color::Gray)),
        Span::styled(value.to_string(), value_style),
    ];
    if editing {
        spans.push(Span::styled("▏", Style::default().fg(Color::Yellow)));
    }
    Line::from(spans)
}

fn status_span(state: &UiState) -> Span<'static> {
    let status = state
        .session
        .as_ref()
        .map(|s| s.status)
        .unwrap_or(ConnectionStatus::Disconnected);
    match status {
        ConnectionStatus::Disconnected => {
            Span::styled("disconnected", Style::default().fg(Color::Red))
        }
        ConnectionStatus::Connecting => {
            Span::styled("connecting…", Style::default().fg(Color::Yellow))
        }
        ConnectionStatus::Connected(ConnectionQuality::Fast) => {
            Span::styled("connected (fast)", Style::default().fg(Color::Green))
        }
        ConnectionStatus::Connected(ConnectionQuality::Slow) => {
            Span::styled("connected (slow)", Style::default().fg(Color::Yellow))
        }
    }
}

fn draw_connection(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let masked = "*".repeat(state.password.chars().count());
    let mut status = vec![
        Span::styled("Status: ", Style::default().fg(Color::Gray)),
        status_span(state),
    ];
    if let Some(op) = state.session.as_ref().and_then(|s| s.busy) {
        status.push(Span::raw(" | running: "));
        status.push(Span::styled(op.to_string(), Style::default().fg(Color::Cyan)));
    }
    let lines = vec![
        field_line(state, InputField::Host, &state.host),
        field_line(state, InputField::User, &state.user),
        field_line(state, InputField::Port, &state.port),
        field_line(state, InputField::Password, &masked),
        Line::from(""),
        Line::from(status),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Device"));
    f.render_widget(p, area);
}

fn tool_span(name: &'static str, available: bool) -> Span<'static> {
    if available {
        Span::styled(format!("{name} ✓"), Style::default().fg(Color::Green))
    } else {
        Span::styled(format!("{name} ✗"), Style::default().fg(Color::Red))
    }
}

fn draw_script(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let caps = state
        .session
        .as_ref()
        .map(|s| s.capabilities)
        .unwrap_or_default();
    let artifact = match state.session.as_ref().and_then(|s| s.artifact_name.clone()) {
        Some(name) => Span::styled(name, Style::default().fg(Color::Green)),
        None => Span::styled("none yet", Style::default().fg(Color::DarkGray)),
    };
    let lines = vec![
        Line::from(vec![
            Span::styled("Mechanism: ", Style::default().fg(Color::Gray)),
            Span::raw(state.mechanism.label()),
        ]),
        field_line(state, InputField::LocalScript, &state.local_script),
        field_line(state, InputField::RemoteScript, &state.remote_script),
        Line::from(vec![
            Span::styled("Tools: ", Style::default().fg(Color::Gray)),
            tool_span("sshpass", caps.password_injection),
            Span::raw("  "),
            tool_span("rsync", caps.progress_transfer),
            Span::raw(if state.verbose { "  verbose" } else { "" }),
        ]),
        Line::from(vec![
            Span::styled("IPA: ", Style::default().fg(Color::Gray)),
            artifact,
        ]),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Script"));
    f.render_widget(p, area);
}

fn draw_bundles(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(Block::default().borders(Borders::ALL).inner(area));

    let title = format!("Bundles ({}/{})", state.bundles.len(), state.bundle_total);
    f.render_widget(Block::default().borders(Borders::ALL).title(title), area);
    f.render_widget(
        Paragraph::new(field_line(state, InputField::Filter, &state.filter)),
        chunks[0],
    );

    let items: Vec<ListItem> = state
        .bundles
        .iter()
        .map(|path| {
            let short = path.strip_prefix(APPS_ROOT).unwrap_or(path);
            ListItem::new(short.trim_end_matches('/').to_string())
        })
        .collect();
    let list = List::new(items)
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    if !state.bundles.is_empty() {
        list_state.select(Some(state.selected));
    }
    f.render_stateful_widget(list, chunks[1], &mut list_state);
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Command => Color::Cyan,
        Severity::Info => Color::White,
        Severity::Success => Color::Green,
        Severity::Warning => Color::Yellow,
        Severity::Error => Color::Red,
        Severity::Stdout => Color::Gray,
        Severity::Stderr => Color::LightRed,
    }
}

fn draw_log(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    // Borders take two rows; show the newest lines that fit.
    let visible = area.height.saturating_sub(2) as usize;
    let start = state.log.len().saturating_sub(visible);
    let lines: Vec<Line> = state.log[start..]
        .iter()
        .map(|l| {
            Line::from(vec![
                Span::styled(format!("{} ", l.stamp), Style::default().fg(Color::DarkGray)),
                Span::styled(l.text.clone(), Style::default().fg(severity_color(l.severity))),
            ])
        })
        .collect();
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Log"));
    f.render_widget(p, area);
}

fn draw_progress(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let busy = state.session.as_ref().and_then(|s| s.busy);
    let (percent, label) = match (state.progress, busy) {
        (Some((op, p)), _) => (p, format!("{op} {p}%")),
        (None, Some(op)) => (0, format!("{op} running…")),
        (None, None) => (0, "idle".to_string()),
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(u16::from(percent.min(100)))
        .label(label);
    f.render_widget(gauge, area);
}

fn draw_footer(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let key = |k: &'static str, what: &'static str, enabled: bool| -> Vec<Span<'static>> {
        let style = if enabled {
            Style::default().fg(Color::Magenta)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        vec![Span::styled(k, style), Span::raw(format!(" {what}  "))]
    };
    let mut spans = Vec::new();
    spans.extend(key("c", "connect", state.allows(OperationKind::TestConnection)));
    spans.extend(key("d", "disconnect", state.is_connected()));
    spans.extend(key("l", "list", state.allows(OperationKind::ListBundles)));
    spans.extend(key("r", "run", state.allows(OperationKind::Execute)));
    spans.extend(key("g", "download", state.allows(OperationKind::DownloadArtifact)));
    spans.extend(key("?", "help", true));
    if !state.info.is_empty() {
        spans.push(Span::raw("| "));
        spans.push(Span::styled(state.info.clone(), Style::default().fg(Color::Yellow)));
    }
    let p = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}
