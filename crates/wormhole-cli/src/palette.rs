use std::collections::HashMap;

use console::{Color, StyledObject, style};

const COLORS: &[Color] = &[
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
    Color::Red,
];

/// Stable display color per nickname, handed out in first-seen order.
///
/// Owned by one room session; a new session starts from the first color again.
#[derive(Debug, Default)]
pub struct NickPalette {
    assigned: HashMap<String, Color>,
}

impl NickPalette {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&mut self, nick: &str) -> Color {
        if let Some(color) = self.assigned.get(nick) {
            return *color;
        }
        let color = COLORS[self.assigned.len() % COLORS.len()];
        self.assigned.insert(nick.to_string(), color);
        color
    }

    pub fn paint(&mut self, nick: &str) -> StyledObject<String> {
        let color = self.color_for(nick);
        style(nick.to_string()).fg(color).bold()
    }

    pub fn clear(&mut self) {
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_nick_keeps_its_color() {
        let mut palette = NickPalette::new();
        let first = palette.color_for("ana");
        palette.color_for("ben");
        assert_eq!(palette.color_for("ana"), first);
    }

    #[test]
    fn test_colors_rotate_in_first_seen_order() {
        let mut palette = NickPalette::new();
        let colors: Vec<Color> = (0..COLORS.len() + 1)
            .map(|i| palette.color_for(&format!("nick{i}")))
            .collect();

        assert_eq!(&colors[..COLORS.len()], COLORS);
        assert_eq!(colors[COLORS.len()], COLORS[0]);
    }

    #[test]
    fn test_clear_starts_over() {
        let mut palette = NickPalette::new();
        palette.color_for("ana");
        palette.color_for("ben");
        palette.clear();
        assert_eq!(palette.color_for("ben"), COLORS[0]);
    }
}
