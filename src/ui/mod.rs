use ratatui::layout::{Alignment, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};
use ratatui::Frame;

pub mod layout;

use crate::app::{App, StatusLevel, BUTTON};
use crate::infrastructure::runtime::BridgeState;

pub fn draw(f: &mut Frame, app: &mut App) {
    let button_width = BUTTON.len() as u16 + 6;
    let areas = layout::areas(f.size(), button_width);
    app.button_area = Some(areas.button);

    draw_header(f, areas.header, app);
    draw_label(f, areas.label, app);
    draw_button(f, areas.button, app);
    draw_history(f, areas.history, app);
    draw_status_line(f, areas.status_line, app);
    draw_help_line(f, areas.help_line);
}

fn draw_header(f: &mut Frame, area: Rect, app: &App) {
    let (state, color) = match app.bridge.map(|stats| stats.state) {
        Some(BridgeState::Running) => ("running", Color::Yellow),
        Some(BridgeState::AwaitingReentry) => ("awaiting re-entry", Color::Cyan),
        Some(BridgeState::Done) => ("done", Color::Green),
        Some(BridgeState::Idle) | None => ("idle", Color::DarkGray),
    };
    let line = Line::from(vec![
        Span::styled("hostguest", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  guest: "),
        Span::styled(app.guest_name, Style::default().fg(Color::Magenta)),
        Span::raw("  state: "),
        Span::styled(state, Style::default().fg(color)),
    ]);
    let header = Paragraph::new(line).block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn draw_label(f: &mut Frame, area: Rect, app: &App) {
    let label = Paragraph::new(app.label.as_str())
        .alignment(Alignment::Center)
        .style(Style::default().add_modifier(Modifier::BOLD));
    f.render_widget(label, area);
}

fn draw_button(f: &mut Frame, area: Rect, app: &App) {
    let busy = matches!(
        app.bridge.map(|stats| stats.state),
        Some(BridgeState::Running | BridgeState::AwaitingReentry)
    );
    let style = if busy {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default().fg(Color::White)
    };
    let button = Paragraph::new(BUTTON)
        .alignment(Alignment::Center)
        .style(style)
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(button, area);
}

fn draw_history(f: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .history
        .iter()
        .map(|line| ListItem::new(line.as_str()))
        .collect();
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::TOP)
            .title("Guest runs"),
    );
    f.render_widget(list, area);
}

fn draw_status_line(f: &mut Frame, area: Rect, app: &App) {
    let color = match app.status_level {
        StatusLevel::Info => Color::Gray,
        StatusLevel::Warn => Color::Yellow,
        StatusLevel::Error => Color::Red,
    };
    let mut spans = vec![Span::styled(app.status.as_str(), Style::default().fg(color))];
    if let Some(stats) = app.bridge {
        spans.push(Span::styled(
            format!(
                "  run {} · bursts {} · tokens {}",
                stats.run, stats.bursts, stats.tokens_posted
            ),
            Style::default().fg(Color::DarkGray),
        ));
    }
    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_help_line(f: &mut Frame, area: Rect) {
    let help = Paragraph::new("Enter ask · c complete run · r reset · q quit")
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(help, area);
}
