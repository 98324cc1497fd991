use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
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
            Span::raw("  Quit"),
        ]),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        key_line("n", 11, "New run"),
        key_line("x", 11, "Discard the current run"),
        Line::from(""),
        Line::from("Records tab:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Navigate"),
        ]),
        key_line("[ / ]", 7, "Previous / next run"),
        key_line("space", 7, "Toggle selection"),
        key_line("a", 11, "Select all / none"),
        key_line("v", 11, "Validate selection (or record under cursor)"),
        key_line("m", 11, "Migrate selection"),
        key_line("y", 11, "Verify selection"),
        key_line("c", 11, "Cancel running migration"),
        Line::from(""),
        Line::from("Failed tab:"),
        key_line("f", 11, "Cycle validation / migration / verification failures"),
        key_line("↑/↓", 9, "Scroll"),
        Line::from(""),
        Line::from("Engine control (disabled while a command is in flight):"),
        key_line("p", 11, "Pause"),
        key_line("u", 11, "Resume"),
        key_line("s", 11, "Stop"),
        key_line("R", 11, "Restart"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
