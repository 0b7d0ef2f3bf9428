use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

fn key_line(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (waits for a running command)"),
        ]),
        key_line("c", 11, "Connect (test SSH login)"),
        key_line("d", 11, "Disconnect"),
        key_line("l", 11, "List application bundles"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Select bundle"),
        ]),
        key_line("r", 11, "Run extraction on the selected bundle"),
        key_line("t", 11, "Transfer the local script only"),
        key_line("x", 11, "Execute the device script only"),
        key_line("g", 11, "Download the IPA"),
        key_line("m", 11, "Switch script mechanism (local / device)"),
        key_line("v", 11, "Toggle verbose command logging"),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Editing:"),
        key_line("i", 11, "Edit inputs (connection fields are locked while connected)"),
        key_line("/", 11, "Edit the bundle filter"),
        key_line("tab", 9, "Next field (shift-tab: previous)"),
        key_line("enter/esc", 3, "Stop editing"),
        Line::from(""),
        Line::from("Notes:"),
        Line::from("  Without sshpass, ssh may ask for the password on the terminal."),
        Line::from("  Without rsync, downloads use scp and show no progress."),
        Line::from("  Set RUST_LOG to change what goes to the log file."),
    ])
    .wrap(Wrap { trim: false })
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
