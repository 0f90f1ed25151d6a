//! Binary snapshot encoding.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header (28 bytes)
//!   u16 magic 0x5654 | u8 version | u8 flags
//!   u32 cols | u32 rows
//!   i32 viewport_y | i32 cursor_x | i32 cursor_y
//!   u32 reserved
//! rows
//!   0xFE n          n consecutive empty rows (default-styled spaces)
//!   0xFD u16 count  followed by `count` cells
//! cell
//!   0x00            default space, also resets the running style
//!   type [char] [style]
//!     type & 0x03   0x01 = ASCII (1 byte), 0x02 = UTF-8 (len byte + bytes,
//!                   len bit 7 marks a wide glyph)
//!     type & 0x80   style follows; otherwise the previous cell's style is reused
//!     type & 0x40   attrs byte
//!     type & 0x20   fg (palette byte, or 3 RGB bytes when type & 0x08)
//!     type & 0x10   bg (palette byte, or 3 RGB bytes when type & 0x04)
//! ```
//!
//! The running style resets to the default at the start of every row, so
//! rows decode independently.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::snapshot::{BufferCell, BufferSnapshot, Color, MAX_CELL_BYTES, blank_row};

pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 2;
pub const HEADER_LEN: usize = 28;

const ROW_EMPTY: u8 = 0xFE;
const ROW_CELLS: u8 = 0xFD;

const CELL_DEFAULT: u8 = 0x00;
const CELL_ASCII: u8 = 0x01;
const CELL_UNICODE: u8 = 0x02;
const CELL_KIND_MASK: u8 = 0x03;
const HAS_STYLE: u8 = 0x80;
const HAS_ATTRS: u8 = 0x40;
const HAS_FG: u8 = 0x20;
const HAS_BG: u8 = 0x10;
const FG_RGB: u8 = 0x08;
const BG_RGB: u8 = 0x04;

const WIDE_FLAG: u8 = 0x80;

/// Largest screen, in cells, a decoder will materialise.
pub const MAX_FRAME_CELLS: usize = 4 * 1024 * 1024;

/// Snapshot decoding error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Bad magic: {0:#06x}")]
    BadMagic(u16),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("Truncated input at byte {0}")]
    Truncated(usize),
    #[error("Invalid row marker {marker:#04x} at byte {offset}")]
    InvalidRowMarker { marker: u8, offset: usize },
    #[error("Invalid cell type {kind:#04x} at byte {offset}")]
    InvalidCellType { kind: u8, offset: usize },
    #[error("Invalid UTF-8 in cell at byte {0}")]
    InvalidUtf8(usize),
    #[error("Row count mismatch: header says {expected}, found {found}")]
    RowCountMismatch { expected: usize, found: usize },
    #[error("{0} trailing bytes after last row")]
    TrailingBytes(usize),
    #[error("Frame too large: {cols}x{rows}")]
    FrameTooLarge { cols: u32, rows: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Style {
    fg: Option<Color>,
    bg: Option<Color>,
    attrs: u8,
}

impl Style {
    const fn of(cell: &BufferCell) -> Self {
        Self {
            fg: cell.fg,
            bg: cell.bg,
            attrs: cell.attrs,
        }
    }
}

/// Encode a snapshot into its binary form.
#[must_use]
pub fn encode_snapshot(snapshot: &BufferSnapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        HEADER_LEN + snapshot.cells.len() * (3 + usize::from(snapshot.cols)),
    );

    buf.put_u16_le(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(0);
    buf.put_u32_le(u32::from(snapshot.cols));
    buf.put_u32_le(u32::try_from(snapshot.cells.len()).unwrap_or(u32::MAX));
    buf.put_i32_le(snapshot.viewport_y);
    buf.put_i32_le(snapshot.cursor_x);
    buf.put_i32_le(snapshot.cursor_y);
    buf.put_u32_le(0);

    let mut empty_run: u8 = 0;
    for row in &snapshot.cells {
        if is_empty_row(row, snapshot.cols) {
            empty_run += 1;
            if empty_run == u8::MAX {
                buf.put_u8(ROW_EMPTY);
                buf.put_u8(empty_run);
                empty_run = 0;
            }
            continue;
        }
        if empty_run > 0 {
            buf.put_u8(ROW_EMPTY);
            buf.put_u8(empty_run);
            empty_run = 0;
        }
        encode_row(&mut buf, row);
    }
    if empty_run > 0 {
        buf.put_u8(ROW_EMPTY);
        buf.put_u8(empty_run);
    }

    buf.freeze()
}

fn is_empty_row(row: &[BufferCell], cols: u16) -> bool {
    row.len() == usize::from(cols) && row.iter().all(BufferCell::is_default_space)
}

fn encode_row(buf: &mut BytesMut, row: &[BufferCell]) {
    buf.put_u8(ROW_CELLS);
    buf.put_u16_le(u16::try_from(row.len()).unwrap_or(u16::MAX));

    let mut current = Style::default();
    for cell in row.iter().take(usize::from(u16::MAX)) {
        if cell.is_default_space() {
            buf.put_u8(CELL_DEFAULT);
            current = Style::default();
            continue;
        }

        let text = clamp_utf8(&cell.ch);
        let ascii = text.len() == 1 && text.is_ascii() && cell.width == 1;
        let style = Style::of(cell);

        let mut kind = if ascii { CELL_ASCII } else { CELL_UNICODE };
        if style != current {
            kind |= HAS_STYLE;
            if style.attrs != 0 {
                kind |= HAS_ATTRS;
            }
            match style.fg {
                Some(Color::Rgb(..)) => kind |= HAS_FG | FG_RGB,
                Some(Color::Palette(_)) => kind |= HAS_FG,
                None => {}
            }
            match style.bg {
                Some(Color::Rgb(..)) => kind |= HAS_BG | BG_RGB,
                Some(Color::Palette(_)) => kind |= HAS_BG,
                None => {}
            }
        }
        buf.put_u8(kind);

        if ascii {
            buf.put_slice(text.as_bytes());
        } else {
            // clamp_utf8 keeps the length within 7 bits
            let len = u8::try_from(text.len()).unwrap_or(0x7F) & 0x7F;
            let wide = if cell.width >= 2 { WIDE_FLAG } else { 0 };
            buf.put_u8(wide | len);
            buf.put_slice(text.as_bytes());
        }

        if kind & HAS_STYLE != 0 {
            if style.attrs != 0 {
                buf.put_u8(style.attrs);
            }
            if let Some(fg) = style.fg {
                put_color(buf, fg);
            }
            if let Some(bg) = style.bg {
                put_color(buf, bg);
            }
            current = style;
        }
    }
}

fn put_color(buf: &mut BytesMut, color: Color) {
    match color {
        Color::Palette(index) => buf.put_u8(index),
        Color::Rgb(r, g, b) => buf.put_slice(&[r, g, b]),
    }
}

/// Truncate to at most `MAX_CELL_BYTES`, on a char boundary.
fn clamp_utf8(text: &str) -> &str {
    if text.len() <= MAX_CELL_BYTES {
        return text;
    }
    let mut end = MAX_CELL_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Cursor over the input that reports how far it got on failure.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated(self.data.len()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn color(&mut self, rgb: bool) -> Result<Color, DecodeError> {
        if rgb {
            let b = self.take(3)?;
            Ok(Color::Rgb(b[0], b[1], b[2]))
        } else {
            Ok(Color::Palette(self.u8()?))
        }
    }
}

/// Decode a snapshot produced by [`encode_snapshot`].
///
/// # Errors
/// Returns a `DecodeError` describing the first inconsistency found.
pub fn decode_snapshot(data: &[u8]) -> Result<BufferSnapshot, DecodeError> {
    let mut reader = Reader::new(data);

    let magic = reader.u16()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let _flags = reader.u8()?;
    let cols = reader.u32()?;
    let rows = reader.u32()?;
    let viewport_y = reader.i32()?;
    let cursor_x = reader.i32()?;
    let cursor_y = reader.i32()?;
    let _reserved = reader.u32()?;

    let too_large = DecodeError::FrameTooLarge { cols, rows };
    let (Ok(cols), Ok(rows16)) = (u16::try_from(cols), u16::try_from(rows)) else {
        return Err(too_large);
    };
    if usize::from(cols) * usize::from(rows16) > MAX_FRAME_CELLS {
        return Err(too_large);
    }
    let expected = usize::from(rows16);
    // Every run of up to 255 rows costs at least two bytes.
    if reader.remaining() < expected.div_ceil(usize::from(u8::MAX)) * 2 {
        return Err(DecodeError::Truncated(data.len()));
    }
    let mut cells: Vec<Vec<BufferCell>> = Vec::with_capacity(expected.min(reader.remaining()));

    while cells.len() < expected {
        let offset = reader.pos;
        match reader.u8()? {
            ROW_EMPTY => {
                let count = usize::from(reader.u8()?);
                if cells.len() + count > expected {
                    return Err(DecodeError::RowCountMismatch {
                        expected,
                        found: cells.len() + count,
                    });
                }
                cells.extend(std::iter::repeat_with(|| blank_row(cols)).take(count));
            }
            ROW_CELLS => {
                let count = usize::from(reader.u16()?);
                cells.push(decode_row(&mut reader, count)?);
            }
            marker => return Err(DecodeError::InvalidRowMarker { marker, offset }),
        }
    }

    if reader.remaining() > 0 {
        return Err(DecodeError::TrailingBytes(reader.remaining()));
    }

    Ok(BufferSnapshot {
        cols,
        rows: rows16,
        viewport_y,
        cursor_x,
        cursor_y,
        cells,
    })
}

fn decode_row(reader: &mut Reader<'_>, count: usize) -> Result<Vec<BufferCell>, DecodeError> {
    let mut row = Vec::with_capacity(count.min(reader.remaining()));
    let mut current = Style::default();

    for _ in 0..count {
        let offset = reader.pos;
        let kind = reader.u8()?;
        if kind == CELL_DEFAULT {
            row.push(BufferCell::blank());
            current = Style::default();
            continue;
        }

        let (ch, width) = match kind & CELL_KIND_MASK {
            CELL_ASCII => {
                let byte = reader.u8()?;
                if !byte.is_ascii() {
                    return Err(DecodeError::InvalidUtf8(offset));
                }
                (char::from(byte).to_string(), 1)
            }
            CELL_UNICODE => {
                let len_byte = reader.u8()?;
                let bytes = reader.take(usize::from(len_byte & 0x7F))?;
                let text =
                    std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(offset))?;
                let width = if len_byte & WIDE_FLAG != 0 { 2 } else { 1 };
                (text.to_string(), width)
            }
            _ => return Err(DecodeError::InvalidCellType { kind, offset }),
        };

        if kind & HAS_STYLE != 0 {
            current = Style {
                attrs: if kind & HAS_ATTRS != 0 { reader.u8()? } else { 0 },
                fg: if kind & HAS_FG != 0 {
                    Some(reader.color(kind & FG_RGB != 0)?)
                } else {
                    None
                },
                bg: if kind & HAS_BG != 0 {
                    Some(reader.color(kind & BG_RGB != 0)?)
                } else {
                    None
                },
            };
        }

        row.push(BufferCell {
            ch,
            width,
            fg: current.fg,
            bg: current.bg,
            attrs: current.attrs,
        });
    }

    Ok(row)
}
