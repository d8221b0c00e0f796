use ratatui::Frame;
use ratatui::layout::Rect;
use ratatui::prelude::Stylize;
use ratatui::widgets::{Block, List, ListItem, Scrollbar, ScrollbarOrientation};

use super::{BLUE, SCROLL_CONTROL_TEXT};

use crate::State;

pub fn draw_output(state: &mut State, f: &mut Frame, output: Rect) {
    let len = state.output.len();
    // borders
    let max = output.height.saturating_sub(2) as usize;
    let skip = state.output_scroll.scroll.min(len.saturating_sub(max));

    state.output_scroll.state = state.output_scroll.state.content_length(len);

    let outputs: Vec<ListItem> =
        state.output.iter().skip(skip).take(max).map(|line| ListItem::new(line.clone())).collect();
    let output_block = List::new(outputs)
        .block(Block::bordered().title(format!("Output {SCROLL_CONTROL_TEXT}").fg(BLUE)));
    f.render_widget(output_block, output);

    f.render_stateful_widget(
        Scrollbar::new(ScrollbarOrientation::VerticalRight),
        output,
        &mut state.output_scroll.state,
    );
}
