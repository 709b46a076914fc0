use anyhow::{Context, Result};
use csv::Writer;
use std::{fs::File, io, path::Path};

use crate::{
    claims::{ClaimRecord, EXPORT_HEADERS},
    common::ensure_parent_dir,
    workflow::LookupResult,
};

pub const COL_PHONE: &str = "Teléfono";
pub const COL_STATUS: &str = "Estado";

/// Lookup results as CSV: the export columns plus phone and status.
///
/// Each row is flushed as soon as it is written so an aborted run keeps
/// everything processed so far.
pub struct LookupOutput<W: io::Write> {
    writer: Writer<W>,
    rows: usize,
}

impl LookupOutput<File> {
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed creating output {}", path.display()))?;
        Self::new(file)
    }
}

impl<W: io::Write> LookupOutput<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        let mut header: Vec<&str> = EXPORT_HEADERS.to_vec();
        header.extend([COL_PHONE, COL_STATUS]);
        writer
            .write_record(&header)
            .context("Failed writing output header")?;
        writer.flush().context("Failed flushing output header")?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write(&mut self, claim: &ClaimRecord, result: &LookupResult) -> Result<()> {
        let [claim_id, date, cause, insurer] = claim.sheet_columns();
        let status = result.status.to_string();
        self.writer
            .write_record([
                claim_id.as_str(),
                date.as_str(),
                cause.as_str(),
                insurer.as_str(),
                result.phone.as_deref().unwrap_or(""),
                status.as_str(),
            ])
            .with_context(|| format!("Failed writing output row for {}", claim.claim_id))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed flushing output row for {}", claim.claim_id))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    #[cfg(test)]
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("Failed finishing output: {}", err.error()))
    }
}
