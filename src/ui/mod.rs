use ratatui::Frame;
use ratatui::layout::Constraint::{Fill, Length};
use ratatui::layout::Layout;
use ratatui::style::Color;

use crate::State;

pub mod input;
pub mod output;
pub mod title;

// Ayu bell colors
pub const BLUE: Color = Color::Rgb(0x59, 0xc2, 0xff);
pub const PURPLE: Color = Color::Rgb(0xd2, 0xa6, 0xff);
pub const ORANGE: Color = Color::Rgb(0xff, 0x8f, 0x40);
pub const YELLOW: Color = Color::Rgb(0xe6, 0xb4, 0x50);
pub const GREEN: Color = Color::Rgb(0xaa, 0xd9, 0x4c);
pub const RED: Color = Color::Rgb(0xff, 0x33, 0x33);
pub const GRAY_FG: Color = Color::Rgb(0x6c, 0x73, 0x80);

pub const SCROLL_CONTROL_TEXT: &str = "(up(k), down(j), 50 up(K), 50 down(J), top(g), bottom(G))";

pub fn ui(f: &mut Frame, state: &mut State) {
    let vertical = Layout::vertical([Length(2), Fill(1), Length(3)]);
    let [title_area, output, input] = vertical.areas(f.area());

    title::draw_title_area(state, f, title_area);
    output::draw_output(state, f, output);
    input::draw_input(title_area, state, f, input);
}
