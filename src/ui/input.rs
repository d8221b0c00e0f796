use ratatui::prelude::Stylize;
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, layout::Rect, style::Style};

use super::{BLUE, GRAY_FG, GREEN, ORANGE};
use crate::{InputMode, State};

const PROMPT: &str = "> ";

pub fn draw_input(title_area: Rect, state: &mut State, f: &mut Frame, input: Rect) {
    // keep 2 for borders and 1 for cursor
    let width = title_area.width.saturating_sub(3);

    let scroll = state.input.visual_scroll(width as usize);

    let txt_input = Paragraph::new(format!("{PROMPT}{}", state.input.value()))
        .style(match state.input_mode {
            InputMode::Normal => Style::default(),
            InputMode::Editing => Style::default().fg(GREEN),
        })
        .scroll((0, scroll as u16))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(vec!["|".fg(GRAY_FG), state.status.clone().fg(BLUE), "|".fg(GRAY_FG)])
                .title(vec!["|".fg(GRAY_FG), state.target.clone().fg(ORANGE), "|".fg(GRAY_FG)]),
        );

    f.render_widget(txt_input, input);
    if let InputMode::Editing = state.input_mode {
        f.set_cursor_position((
            input.x
                + ((state.input.visual_cursor()).max(scroll) - scroll) as u16
                + 1
                + PROMPT.len() as u16,
            input.y + 1,
        ));
    }
}
