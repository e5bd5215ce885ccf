use comfy_table::{Cell, ContentArrangement};
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use crossterm::tty::IsTty;
use std::io::{self, Stdout, Write};

use crate::colors::{ColumnRole, Palette};
use crate::error::RenderError;
use crate::model::{ResourceRow, TableSpec};

// Outer box with a rule under the header and no rules between rows.
const BOX_BORDERS: &str = "││──├─┼┤│ ┼├┤┬┴┌┐└┘";

/// Output target for tables and banners.
pub trait Screen: Write {
    /// Wipes the previous render. Non-terminal targets treat this as a no-op.
    fn clear_viewport(&mut self) -> io::Result<()>;
}

pub struct TerminalScreen {
    out: Stdout,
    interactive: bool,
}

impl TerminalScreen {
    pub fn stdout() -> Self {
        let out = io::stdout();
        let interactive = out.is_tty();
        Self { out, interactive }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }
}

impl Write for TerminalScreen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl Screen for TerminalScreen {
    fn clear_viewport(&mut self) -> io::Result<()> {
        if !self.interactive {
            return Ok(());
        }
        execute!(self.out, Clear(ClearType::All), MoveTo(0, 0))
    }
}

/// Rows are displayed in insertion order.
#[derive(Debug, Clone)]
pub struct Table {
    spec: TableSpec,
    rows: Vec<ResourceRow>,
}

impl Table {
    pub fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            rows: Vec::new(),
        }
    }

    /// Rejects rows whose cell count differs from the header count.
    pub fn push(&mut self, row: ResourceRow) -> Result<(), RenderError> {
        if row.len() != self.spec.len() {
            return Err(RenderError::RowShape {
                expected: self.spec.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Lays the table out and writes it with a single `write_all`.
    pub fn render<W>(&self, out: &mut W, palette: Palette) -> Result<(), RenderError>
    where
        W: Write + ?Sized,
    {
        let mut text = self.layout(palette).to_string();
        text.push('\n');
        out.write_all(text.as_bytes())?;
        Ok(())
    }

    // Cells arrive pre-colored; `custom_styling` keeps escape codes out of the widths.
    fn layout(&self, palette: Palette) -> comfy_table::Table {
        let roles = self
            .spec
            .headers()
            .iter()
            .map(|header| ColumnRole::from_header(header))
            .collect::<Vec<_>>();

        let mut grid = comfy_table::Table::new();
        grid.load_preset(BOX_BORDERS)
            .set_content_arrangement(ContentArrangement::Disabled)
            .set_header(self.spec.headers());
        for row in &self.rows {
            grid.add_row(
                row.cells()
                    .iter()
                    .zip(&roles)
                    .map(|(cell, role)| Cell::new(palette.decorate(*role, cell))),
            );
        }
        grid
    }
}

/// In-memory screen that records how often it was cleared.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryScreen {
    pub buffer: Vec<u8>,
    pub clears: usize,
}

#[cfg(test)]
impl MemoryScreen {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

#[cfg(test)]
impl Write for MemoryScreen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Screen for MemoryScreen {
    fn clear_viewport(&mut self) -> io::Result<()> {
        self.clears += 1;
        Ok(())
    }
}
