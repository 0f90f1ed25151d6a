//! Headless terminal emulation backed by `alacritty_terminal`.

use alacritty_terminal::{
    event::VoidListener,
    grid::Dimensions,
    index::{Column, Line},
    term::{
        Config as TermConfig, Term,
        cell::{Cell, Flags},
    },
    vte::ansi::{Color as AnsiColor, NamedColor, Processor},
};

use crate::snapshot::{BufferCell, BufferSnapshot, Color, MAX_CELL_BYTES, attrs};

/// Terminal size handed to alacritty.
struct TermSize {
    cols: usize,
    rows: usize,
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// One session's virtual screen.
pub struct Emulator {
    term: Term<VoidListener>,
    parser: Processor,
}

impl Emulator {
    /// Create an emulator of `cols`x`rows` keeping `scrollback` history lines.
    #[must_use]
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        let size = TermSize {
            cols: usize::from(cols.max(1)),
            rows: usize::from(rows.max(1)),
        };
        let config = TermConfig {
            scrolling_history: scrollback,
            ..TermConfig::default()
        };
        let mut emulator = Self {
            term: Term::new(config, &size, VoidListener),
            parser: Processor::new(),
        };
        // LF also returns the carriage, like a cooked tty
        emulator.write(b"\x1b[20h");
        emulator
    }

    /// Feed raw output bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.parser.advance(&mut self.term, data);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 || (cols, rows) == self.size() {
            return;
        }
        self.term.resize(TermSize {
            cols: usize::from(cols),
            rows: usize::from(rows),
        });
    }

    /// Drop all scrollback; the visible screen and cursor are kept.
    pub fn clear_scrollback(&mut self) {
        self.term.grid_mut().clear_history();
    }

    /// Current size as `(cols, rows)`.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        let grid = self.term.grid();
        (
            u16::try_from(grid.columns()).unwrap_or(u16::MAX),
            u16::try_from(grid.screen_lines()).unwrap_or(u16::MAX),
        )
    }

    #[must_use]
    pub fn scrollback_len(&self) -> usize {
        self.term.grid().history_size()
    }

    /// Capture the visible screen.
    #[must_use]
    pub fn snapshot(&self) -> BufferSnapshot {
        let grid = self.term.grid();
        let cols = grid.columns();
        let rows = grid.screen_lines();

        let cells = (0..rows)
            .map(|y| {
                let row = &grid[Line(i32::try_from(y).unwrap_or(i32::MAX))];
                let mut out = Vec::with_capacity(cols);
                let mut x = 0;
                while x < cols {
                    let cell = &row[Column(x)];
                    let mut converted = convert_cell(cell);
                    if cell.flags.contains(Flags::WIDE_CHAR) && x + 1 < cols {
                        converted.width = 2;
                        x += 2;
                    } else {
                        // a stray spacer or a wide glyph clipped at the margin
                        // still fills its single column
                        if cell
                            .flags
                            .intersects(Flags::WIDE_CHAR_SPACER | Flags::LEADING_WIDE_CHAR_SPACER)
                        {
                            converted.ch = " ".to_string();
                        }
                        converted.width = 1;
                        x += 1;
                    }
                    out.push(converted);
                }
                out
            })
            .collect();

        let cursor = grid.cursor.point;
        BufferSnapshot {
            cols: u16::try_from(cols).unwrap_or(u16::MAX),
            rows: u16::try_from(rows).unwrap_or(u16::MAX),
            viewport_y: i32::try_from(grid.history_size()).unwrap_or(i32::MAX),
            cursor_x: i32::try_from(cursor.column.0).unwrap_or(i32::MAX),
            cursor_y: cursor.line.0,
            cells,
        }
    }
}

fn convert_cell(cell: &Cell) -> BufferCell {
    let mut text = String::new();
    text.push(if cell.c == '\0' { ' ' } else { cell.c });
    if let Some(marks) = cell.zerowidth() {
        for mark in marks {
            if text.len() + mark.len_utf8() > MAX_CELL_BYTES {
                break;
            }
            text.push(*mark);
        }
    }

    BufferCell {
        ch: text,
        width: 1,
        fg: convert_color(cell.fg, NamedColor::Foreground),
        bg: convert_color(cell.bg, NamedColor::Background),
        attrs: convert_flags(cell.flags),
    }
}

fn convert_color(color: AnsiColor, default: NamedColor) -> Option<Color> {
    match color {
        AnsiColor::Spec(rgb) => Some(Color::Rgb(rgb.r, rgb.g, rgb.b)),
        AnsiColor::Indexed(index) => Some(Color::Palette(index)),
        AnsiColor::Named(name) if name == default => None,
        AnsiColor::Named(name) => named_index(name).map(Color::Palette),
    }
}

/// Palette slot for the sixteen ANSI colors and their dim variants.
const fn named_index(name: NamedColor) -> Option<u8> {
    let index = match name {
        NamedColor::Black | NamedColor::DimBlack => 0,
        NamedColor::Red | NamedColor::DimRed => 1,
        NamedColor::Green | NamedColor::DimGreen => 2,
        NamedColor::Yellow | NamedColor::DimYellow => 3,
        NamedColor::Blue | NamedColor::DimBlue => 4,
        NamedColor::Magenta | NamedColor::DimMagenta => 5,
        NamedColor::Cyan | NamedColor::DimCyan => 6,
        NamedColor::White | NamedColor::DimWhite => 7,
        NamedColor::BrightBlack => 8,
        NamedColor::BrightRed => 9,
        NamedColor::BrightGreen => 10,
        NamedColor::BrightYellow => 11,
        NamedColor::BrightBlue => 12,
        NamedColor::BrightMagenta => 13,
        NamedColor::BrightCyan => 14,
        NamedColor::BrightWhite => 15,
        _ => return None,
    };
    Some(index)
}

fn convert_flags(flags: Flags) -> u8 {
    let mut out = 0;
    if flags.contains(Flags::BOLD) {
        out |= attrs::BOLD;
    }
    if flags.contains(Flags::ITALIC) {
        out |= attrs::ITALIC;
    }
    if flags.intersects(Flags::UNDERLINE | Flags::DOUBLE_UNDERLINE | Flags::UNDERCURL) {
        out |= attrs::UNDERLINE;
    }
    if flags.contains(Flags::DIM) {
        out |= attrs::DIM;
    }
    if flags.contains(Flags::INVERSE) {
        out |= attrs::INVERSE;
    }
    if flags.contains(Flags::HIDDEN) {
        out |= attrs::INVISIBLE;
    }
    if flags.contains(Flags::STRIKEOUT) {
        out |= attrs::STRIKETHROUGH;
    }
    out
}
