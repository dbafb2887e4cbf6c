//! Output rendering shared by the binaries
//!
//! A [`Reporter`] writes rounds as they arrive so long runs stream their
//! progress. Text output is one line per item and `jsonl` one object per
//! line; `json` collects every item and writes a single array at the end.

use serde::Serialize;
use std::io::Write;
use std::str::FromStr;

use crate::engine::{ItemResult, RoundResult};
use crate::error::{EbbtideError, Result};
use crate::orchestrator::Summary;
use crate::resolver::Disposition;
use crate::types::{Platform, Post};

/// Characters of content shown in text previews
pub const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Jsonl,
}

impl FromStr for OutputFormat {
    type Err = EbbtideError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" => Ok(OutputFormat::Jsonl),
            other => Err(EbbtideError::InvalidInput(format!(
                "Invalid output format: '{}'. Valid options: text, json, jsonl",
                other
            ))),
        }
    }
}

/// One processed item as written in JSON output
#[derive(Debug, Serialize)]
pub struct ItemLine<'a> {
    pub platform: Platform,
    pub round: u32,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_gone: bool,
    pub post: &'a Post,
}

impl<'a> ItemLine<'a> {
    pub fn new(round: &RoundResult, item: &'a ItemResult) -> Self {
        Self {
            platform: round.platform,
            round: round.round,
            disposition: item.disposition,
            error: item.error.as_deref(),
            already_gone: item.already_gone,
            post: &item.post,
        }
    }
}

/// Streams item listings in one output format
#[derive(Debug, Default)]
pub struct Reporter {
    format: OutputFormat,
    collected: Vec<serde_json::Value>,
}

impl Reporter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            collected: Vec::new(),
        }
    }

    /// Write (or, for `json`, buffer) every item of `round`
    pub fn round<W: Write>(&mut self, round: &RoundResult, out: &mut W) -> Result<()> {
        for item in &round.items {
            let line = ItemLine::new(round, item);
            match self.format {
                OutputFormat::Text => writeln!(out, "{}", item_text(round.platform, item))?,
                OutputFormat::Jsonl => {
                    writeln!(out, "{}", serde_json::to_string(&line).map_err(json_error)?)?
                }
                OutputFormat::Json => self
                    .collected
                    .push(serde_json::to_value(&line).map_err(json_error)?),
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Write anything still buffered
    pub fn finish<W: Write>(self, out: &mut W) -> Result<()> {
        if self.format == OutputFormat::Json {
            let array = serde_json::to_string_pretty(&self.collected).map_err(json_error)?;
            writeln!(out, "{}", array)?;
        }
        out.flush()?;
        Ok(())
    }
}

fn item_text(platform: Platform, item: &ItemResult) -> String {
    let mut line = format!(
        "{} | {} | {} | {} | {}",
        item.post.created_at.format("%Y-%m-%d %H:%M:%S"),
        platform,
        item.disposition,
        item.post.id,
        preview(&item.post.content, PREVIEW_CHARS)
    );

    if let Some(error) = &item.error {
        line.push_str(&format!(" [error: {}]", error));
    } else if item.already_gone {
        line.push_str(" [already gone]");
    }

    line
}

/// The first `max` characters of `content` on a single line
pub fn preview(content: &str, max: usize) -> String {
    let flat: String = content
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

/// One progress line for a finished round
pub fn round_progress_text(round: &RoundResult) -> String {
    let counts = &round.counts;
    let mut line = format!(
        "[{}] round {}: {} items, {} actioned, {} kept, {} preserved",
        round.platform,
        round.round,
        round.items.len(),
        counts.actions(),
        counts.kept,
        counts.preserved
    );
    if counts.errored > 0 {
        line.push_str(&format!(", {} errors", counts.errored));
    }
    if let Some(outcome) = &round.outcome {
        line.push_str(&format!(" -> {}", outcome));
    }
    line
}

/// Human-readable line for a finished run
pub fn summary_text(summary: &Summary) -> String {
    let outcome = summary
        .outcome
        .as_ref()
        .map_or_else(|| "unfinished".to_string(), ToString::to_string);

    let counts = &summary.counts;
    format!(
        "{}: {} ({} rounds, {:.1}s) kept={} preserved={} deleted={} unliked={} unshared={} errors={}",
        summary.platform,
        outcome,
        summary.rounds,
        summary.duration.as_secs_f64(),
        counts.kept,
        counts.preserved,
        counts.deleted,
        counts.unliked,
        counts.unshared,
        counts.errored
    )
}

/// Write run summaries in `format`
pub fn write_summaries<W: Write>(summaries: &[Summary], format: OutputFormat, out: &mut W) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for summary in summaries {
                writeln!(out, "{}", summary_text(summary))?;
            }
        }
        OutputFormat::Json => {
            let array = serde_json::to_string_pretty(summaries).map_err(json_error)?;
            writeln!(out, "{}", array)?;
        }
        OutputFormat::Jsonl => {
            for summary in summaries {
                writeln!(out, "{}", serde_json::to_string(summary).map_err(json_error)?)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn json_error(e: serde_json::Error) -> EbbtideError {
    EbbtideError::InvalidInput(format!("Failed to serialize output: {}", e))
}
