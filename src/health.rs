use std::fmt::{self, Display, Formatter};
use std::io::Write;

use crate::colors::Palette;
use crate::error::RenderError;
use crate::model::{ResourceRow, TableSpec};
use crate::watch::build_table;

pub const NODE_COLUMNS: [&str; 5] = ["NAME", "STATUS", "ROLES", "AGE", "VERSION"];
pub const POD_COLUMNS: [&str; 4] = ["NAME", "READY", "STATUS", "RESTARTS"];

const POD_STATUS_CELL: usize = 2;

/// Pod phase tally printed under each namespace table.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct PodSummary {
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
}

impl PodSummary {
    pub fn from_rows(rows: &[ResourceRow]) -> Self {
        let mut summary = Self::default();
        for status in rows.iter().filter_map(|row| row.cells().get(POD_STATUS_CELL)) {
            summary.record(status);
        }
        summary
    }

    fn record(&mut self, status: &str) {
        match status {
            "Running" => self.running += 1,
            "Pending" => self.pending += 1,
            "Failed" | "Error" => self.failed += 1,
            _ => {}
        }
    }
}

impl Display for PodSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Summary: Running: {}, Pending: {}, Failed: {}",
            self.running, self.pending, self.failed
        )
    }
}

/// Writes the node table, or the listing error in its place so the pod
/// sections still follow.
pub fn write_node_section<W>(
    out: &mut W,
    nodes: anyhow::Result<Vec<ResourceRow>>,
    palette: Palette,
) -> Result<(), RenderError>
where
    W: Write + ?Sized,
{
    writeln!(out, "=== Node Status ===")?;
    match nodes {
        Ok(rows) => build_table(TableSpec::new(NODE_COLUMNS), rows).render(&mut *out, palette)?,
        Err(error) => writeln!(out, "Error displaying nodes: {error:#}")?,
    }
    writeln!(out, "\n=== Pod Health ===")?;
    Ok(())
}

/// Namespaces without pods are skipped entirely.
pub fn write_namespace_section<W>(
    out: &mut W,
    namespace: &str,
    rows: Vec<ResourceRow>,
    palette: Palette,
) -> Result<(), RenderError>
where
    W: Write + ?Sized,
{
    if rows.is_empty() {
        return Ok(());
    }

    let summary = PodSummary::from_rows(&rows);
    writeln!(out, "\nNamespace: {namespace}")?;
    build_table(TableSpec::new(POD_COLUMNS), rows).render(&mut *out, palette)?;
    writeln!(out, "{summary}")?;
    Ok(())
}
