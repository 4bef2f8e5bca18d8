use std::fs::File;
use std::io::{self, BufWriter, Write};

use mira_core::WaError;
use tempfile::{NamedTempFile, TempPath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub target: String,
    pub reason: String,
}

impl Failure {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of one target step. A group step may cover many participants.
#[derive(Debug, Default, Clone)]
pub struct StepReport {
    pub success: usize,
    pub invited: usize,
    pub failures: Vec<Failure>,
    /// Result lines for the operator, e.g. `name — link`.
    pub lines: Vec<String>,
}

impl StepReport {
    pub fn success() -> Self {
        Self {
            success: 1,
            ..Self::default()
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn fail(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            failures: vec![Failure::new(target, reason)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Tally {
    pub success: usize,
    pub invited: usize,
    pub failures: Vec<Failure>,
}

impl Tally {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn absorb(&mut self, step: &mut StepReport) {
        self.success += step.success;
        self.invited += step.invited;
        self.failures.append(&mut step.failures);
    }
}

/// Why a job ended before its last target.
#[derive(Debug, Clone)]
pub enum Interruption {
    Stopped,
    SessionLost,
    Permanent(WaError),
    /// Rate limit outlasted every backoff.
    RateLimited { error: WaError, wait_minutes: u64 },
}

/// Accumulates result lines in memory, moving them to a temp file once
/// they outgrow one message. The file is flushed every `threshold` lines.
pub struct ResultSpill {
    threshold: usize,
    lines: Vec<String>,
    file: Option<(BufWriter<File>, TempPath)>,
    written: usize,
}

pub enum SpillOutput {
    Inline(Vec<String>),
    File { path: TempPath, lines: usize },
}

impl ResultSpill {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            lines: Vec::new(),
            file: None,
            written: 0,
        }
    }

    pub fn push(&mut self, line: String) -> io::Result<()> {
        if let Some((writer, _)) = self.file.as_mut() {
            writeln!(writer, "{line}")?;
            self.written += 1;
            if self.written % self.threshold == 0 {
                writer.flush()?;
            }
            return Ok(());
        }

        self.lines.push(line);
        if self.lines.len() > self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("mira-result-")
            .suffix(".txt")
            .tempfile()?;
        let (file, path) = NamedTempFile::into_parts(temp);
        let mut writer = BufWriter::new(file);
        for line in self.lines.drain(..) {
            writeln!(writer, "{line}")?;
            self.written += 1;
        }
        writer.flush()?;
        self.file = Some((writer, path));
        Ok(())
    }

    pub fn finish(self) -> io::Result<SpillOutput> {
        match self.file {
            Some((mut writer, path)) => {
                writer.flush()?;
                Ok(SpillOutput::File {
                    path,
                    lines: self.written,
                })
            }
            None => Ok(SpillOutput::Inline(self.lines)),
        }
    }
}

/// Everything the operator sees when a job ends.
pub struct JobReport {
    pub title: String,
    pub total: usize,
    pub processed: usize,
    pub tally: Tally,
    pub interruption: Option<Interruption>,
    pub output: SpillOutput,
}
