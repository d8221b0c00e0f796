use ratatui::layout::Constraint::Length;
use ratatui::layout::{Alignment, Layout};
use ratatui::prelude::Stylize;
use ratatui::style::Modifier;
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, layout::Rect, style::Style};

use super::{GRAY_FG, GREEN, ORANGE, PURPLE, RED};

use crate::{InputMode, State};

pub fn draw_title_area(state: &mut State, f: &mut Frame, title_area: Rect) {
    let vertical_title = Layout::vertical([Length(1), Length(1)]);
    let [first, second] = vertical_title.areas(title_area);
    f.render_widget(
        Block::new()
            .borders(Borders::TOP)
            .title(vec![
                "|".fg(GRAY_FG),
                env!("CARGO_PKG_NAME").bold(),
                "-".fg(GRAY_FG),
                "v".into(),
                env!("CARGO_PKG_VERSION").into(),
                "|".fg(GRAY_FG),
            ])
            .title_alignment(Alignment::Center),
        first,
    );

    state.status = match state.input_mode {
        InputMode::Normal => "Press q to exit, i to enter input".to_owned(),
        InputMode::Editing => "Press Esc to stop editing, Enter to run command".to_owned(),
    };

    let bold = Style::default().add_modifier(Modifier::BOLD);
    let msg = vec![
        Span::styled("segheap", bold),
        Span::raw(" | "),
        Span::styled("lfhsub", bold),
        Span::raw(" | "),
        Span::styled("lfhctx", bold),
        Span::raw(" | "),
        Span::styled("vsctx", bold),
        Span::raw(" <addr> | "),
        Span::styled("LFH", Style::default().fg(GREEN).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled("VS", Style::default().fg(PURPLE).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled("Busy", Style::default().fg(RED).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled("Address", Style::default().fg(ORANGE).add_modifier(Modifier::BOLD)),
    ];
    let text = Text::from(Line::from(msg));
    let help_message = Paragraph::new(text).alignment(Alignment::Center);
    f.render_widget(help_message, second);
}
