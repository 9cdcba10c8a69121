//! Intra-step compaction of the oracle-facing command history.
//!
//! Once a step's rendered history grows past a token threshold, older commands
//! are folded into a rule-based digest and only the most recent commands stay
//! verbatim. The underlying [`CommandRecord`]s are never removed from the step
//! context, so the persisted log keeps the full trace.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::state::StepContext;
use crate::core::types::{CommandKind, CommandRecord, CompressionEvent, TimeoutKind};

/// Digest lines kept before older entries are summarized as a count.
const MAX_DIGEST_LINES: usize = 40;
const DIGEST_LINE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Estimated tokens of rendered history that trigger compaction.
    pub trigger_tokens: usize,
    /// Compaction never runs on steps with fewer commands.
    pub min_commands: usize,
    /// Share of the trace kept verbatim.
    pub keep_ratio: f64,
    pub min_keep: usize,
    /// Characters of stdout/stderr shown per command.
    pub output_preview_chars: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            trigger_tokens: 12_000,
            min_commands: 10,
            keep_ratio: 0.3,
            min_keep: 3,
            output_preview_chars: 2_000,
        }
    }
}

/// Rough token estimate (four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// History as the oracle sees it: digest (if any) followed by recent commands.
pub fn render_history(ctx: &StepContext, preview_chars: usize) -> String {
    let mut out = String::new();
    if let Some(digest) = &ctx.compacted_history {
        out.push_str(digest);
        out.push_str("\n\n");
    }
    let offset = ctx.compacted_through.min(ctx.commands.len());
    for (i, record) in ctx.recent_commands().iter().enumerate() {
        out.push_str(&render_command(offset + i + 1, record, preview_chars));
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Render one command with bounded output previews.
pub fn render_command(number: usize, record: &CommandRecord, preview_chars: usize) -> String {
    let mut out = format!("#{number} $ {}\n", record.command);
    if !record.reasoning.trim().is_empty() {
        out.push_str(&format!("reason: {}\n", record.reasoning.trim()));
    }
    match record.timeout {
        Some(kind) => out.push_str(&format!(
            "result: TIMEOUT ({}) exit {}\n",
            timeout_label(kind),
            record.exit_code
        )),
        None if record.succeeded() => out.push_str("result: success (exit 0)\n"),
        None => out.push_str(&format!("result: FAILED (exit {})\n", record.exit_code)),
    }
    if !record.stdout.trim().is_empty() {
        out.push_str("stdout:\n");
        out.push_str(&preview(record.stdout.trim_end(), preview_chars));
        out.push('\n');
    }
    if !record.stderr.trim().is_empty() {
        out.push_str("stderr:\n");
        out.push_str(&preview(record.stderr.trim_end(), preview_chars));
        out.push('\n');
    }
    out
}

/// Compact the step's history if it has grown past the threshold.
///
/// Returns the recorded event when a compaction happened.
pub fn maybe_compact(
    ctx: &mut StepContext,
    settings: &CompactionSettings,
) -> Option<CompressionEvent> {
    let total = ctx.commands.len();
    if total < settings.min_commands {
        return None;
    }
    let before = render_history(ctx, settings.output_preview_chars);
    let tokens_before = estimate_tokens(&before);
    if tokens_before <= settings.trigger_tokens {
        return None;
    }

    let keep = keep_count(total, settings);
    let fold_through = total - keep;
    if fold_through <= ctx.compacted_through {
        return None;
    }

    ctx.compacted_history = Some(digest(&ctx.commands[..fold_through]));
    ctx.compacted_through = fold_through;
    let tokens_after = estimate_tokens(&render_history(ctx, settings.output_preview_chars));

    info!(
        step_id = ctx.step_id,
        iteration = ctx.iteration,
        commands_folded = fold_through,
        commands_kept = keep,
        tokens_before,
        tokens_after,
        "compacted step history"
    );
    let event = CompressionEvent {
        iteration: ctx.iteration,
        commands_folded: fold_through,
        commands_kept: keep,
        tokens_before,
        tokens_after,
        timestamp: Utc::now(),
    };
    ctx.compression_events.push(event.clone());
    Some(event)
}

fn keep_count(total: usize, settings: &CompactionSettings) -> usize {
    let ratio = (total as f64 * settings.keep_ratio).round() as usize;
    ratio.max(settings.min_keep).min(total)
}

/// Rule-based digest of folded commands.
pub fn digest(commands: &[CommandRecord]) -> String {
    let succeeded = commands.iter().filter(|c| c.succeeded()).count();
    let failed = commands.len() - succeeded;
    let mut out = format!(
        "Compacted history: {} earlier commands folded ({succeeded} succeeded, {failed} failed).\n",
        commands.len()
    );

    let mut changes: Vec<&str> = Vec::new();
    for record in commands {
        if record.kind == CommandKind::Mutating
            && record.succeeded()
            && !changes.contains(&record.command.as_str())
        {
            changes.push(record.command.as_str());
        }
    }
    if !changes.is_empty() {
        out.push_str("Changes applied:\n");
        for command in &changes {
            out.push_str(&format!("  {}\n", clip(command, DIGEST_LINE_CHARS)));
        }
    }

    let lines = digest_lines(commands);
    out.push_str("Commands:\n");
    let skipped = lines.len().saturating_sub(MAX_DIGEST_LINES);
    if skipped > 0 {
        out.push_str(&format!("  ({skipped} older entries omitted)\n"));
    }
    for line in &lines[skipped..] {
        out.push_str(&format!("  {line}\n"));
    }
    out.trim_end().to_string()
}

/// One line per command, consecutive duplicates collapsed.
fn digest_lines(commands: &[CommandRecord]) -> Vec<String> {
    let mut lines: Vec<(String, usize)> = Vec::new();
    for record in commands {
        let line = digest_line(record);
        match lines.last_mut() {
            Some((last, count)) if *last == line => *count += 1,
            _ => lines.push((line, 1)),
        }
    }
    lines
        .into_iter()
        .map(|(line, count)| {
            if count > 1 {
                format!("{line} (x{count})")
            } else {
                line
            }
        })
        .collect()
}

fn digest_line(record: &CommandRecord) -> String {
    let command = clip(&record.command, DIGEST_LINE_CHARS);
    if record.succeeded() {
        match first_line(&record.stdout) {
            Some(line) => format!("{command} → Success: {}", clip(line, 80)),
            None => format!("{command} → Success"),
        }
    } else {
        let status = match record.timeout {
            Some(kind) => format!("TIMEOUT ({})", timeout_label(kind)),
            None => format!("FAILED (exit {})", record.exit_code),
        };
        match first_line(&record.stderr).or_else(|| first_line(&record.stdout)) {
            Some(line) => format!("{command} → {status}: {}", clip(line, 100)),
            None => format!("{command} → {status}"),
        }
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

/// Keep head and tail of long output; errors usually sit at the end.
fn preview(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!("{head}\n...[{} chars omitted]...\n{tail}", count - 2 * half)
}

fn timeout_label(kind: TimeoutKind) -> &'static str {
    match kind {
        TimeoutKind::Idle => "idle",
        TimeoutKind::Total => "total",
    }
}
