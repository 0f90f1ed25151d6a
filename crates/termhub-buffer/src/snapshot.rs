//! Full-frame screen snapshots.

use serde::{Deserialize, Serialize};

/// Cell attribute bits.
pub mod attrs {
    pub const BOLD: u8 = 0x01;
    pub const ITALIC: u8 = 0x02;
    pub const UNDERLINE: u8 = 0x04;
    pub const DIM: u8 = 0x08;
    pub const INVERSE: u8 = 0x10;
    pub const INVISIBLE: u8 = 0x20;
    pub const STRIKETHROUGH: u8 = 0x40;
}

/// Longest UTF-8 sequence a single cell may carry, combining marks included.
pub const MAX_CELL_BYTES: usize = 127;

/// A foreground or background color. `None` on a cell means the terminal
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// One of the 256 indexed palette entries.
    Palette(u8),
    /// 24-bit true color.
    Rgb(u8, u8, u8),
}

/// One visible cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCell {
    /// Base character followed by any combining marks.
    #[serde(rename = "char")]
    pub ch: String,
    /// Columns occupied: 1, or 2 for wide glyphs.
    pub width: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fg: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg: Option<Color>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attrs: u8,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &u8) -> bool {
    *value == 0
}

impl BufferCell {
    /// A default-styled space.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            ch: " ".to_string(),
            width: 1,
            fg: None,
            bg: None,
            attrs: 0,
        }
    }

    /// An unstyled single-width cell.
    #[must_use]
    pub fn plain(ch: impl Into<String>) -> Self {
        Self {
            ch: ch.into(),
            ..Self::blank()
        }
    }

    #[must_use]
    pub fn with_fg(mut self, fg: Color) -> Self {
        self.fg = Some(fg);
        self
    }

    #[must_use]
    pub fn with_bg(mut self, bg: Color) -> Self {
        self.bg = Some(bg);
        self
    }

    #[must_use]
    pub const fn with_attrs(mut self, attrs: u8) -> Self {
        self.attrs = attrs;
        self
    }

    #[must_use]
    pub const fn wide(mut self) -> Self {
        self.width = 2;
        self
    }

    /// Whether this cell is a space with no styling at all.
    #[must_use]
    pub fn is_default_space(&self) -> bool {
        self.ch == " " && self.width == 1 && self.has_default_style()
    }

    #[must_use]
    pub const fn has_default_style(&self) -> bool {
        self.fg.is_none() && self.bg.is_none() && self.attrs == 0
    }
}

impl Default for BufferCell {
    fn default() -> Self {
        Self::blank()
    }
}

/// A complete rendering of a terminal's visible screen.
///
/// Always a full frame: `cells` holds exactly `rows` rows, and in each row
/// the cell widths add up to exactly `cols`. The right half of a wide glyph
/// is not a cell of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub cols: u16,
    pub rows: u16,
    /// Number of scrollback lines above the visible screen.
    pub viewport_y: i32,
    /// Cursor column, relative to the visible screen.
    pub cursor_x: i32,
    /// Cursor row, relative to the visible screen.
    pub cursor_y: i32,
    pub cells: Vec<Vec<BufferCell>>,
}

impl BufferSnapshot {
    /// An empty screen of the given size with the cursor at the origin.
    #[must_use]
    pub fn blank(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            viewport_y: 0,
            cursor_x: 0,
            cursor_y: 0,
            cells: vec![blank_row(cols); usize::from(rows)],
        }
    }

    /// Check the full-frame invariant.
    #[must_use]
    pub fn is_full_frame(&self) -> bool {
        self.cells.len() == usize::from(self.rows)
            && self.cells.iter().all(|row| {
                row.iter().map(|cell| usize::from(cell.width)).sum::<usize>()
                    == usize::from(self.cols)
            })
    }

    /// Text of one row with trailing blanks removed. Handy for logs and
    /// assertions.
    #[must_use]
    pub fn row_text(&self, row: usize) -> String {
        self.cells
            .get(row)
            .map(|cells| {
                cells
                    .iter()
                    .map(|cell| cell.ch.as_str())
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .unwrap_or_default()
    }
}

/// A row of `cols` default spaces.
#[must_use]
pub fn blank_row(cols: u16) -> Vec<BufferCell> {
    vec![BufferCell::blank(); usize::from(cols)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_snapshot_is_full_frame() {
        let snapshot = BufferSnapshot::blank(80, 24);
        assert!(snapshot.is_full_frame());
        assert_eq!(snapshot.cells.len(), 24);
        assert!(snapshot.cells[0].iter().all(BufferCell::is_default_space));
    }

    #[test]
    fn test_wide_cells_count_twice() {
        let mut snapshot = BufferSnapshot::blank(4, 1);
        snapshot.cells[0] = vec![
            BufferCell::plain("中").wide(),
            BufferCell::blank(),
            BufferCell::blank(),
        ];
        assert!(snapshot.is_full_frame());

        snapshot.cells[0].push(BufferCell::blank());
        assert!(!snapshot.is_full_frame());
    }

    #[test]
    fn test_styled_space_is_not_default() {
        let cell = BufferCell::blank().with_bg(Color::Palette(4));
        assert!(!cell.is_default_space());
        assert!(BufferCell::blank().is_default_space());
    }

    #[test]
    fn test_cell_json_shape() {
        let cell = BufferCell::plain("x").with_attrs(attrs::BOLD);
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["char"], "x");
        assert_eq!(json["attrs"], 1);
        assert!(json.get("fg").is_none());
    }
}
