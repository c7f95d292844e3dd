//! ProgressReporter - 定期的な進捗表示
//!
//! # テンプレート
//! - `{total}`: loader の総件数
//! - `{done}`: 完了件数（DoneList の長さ）
//! - `{percent}`: 完了率（0.0〜1.0 の小数）。`{percent:.2}` で桁数指定、
//!   `{percent:.1%}` でパーセント表記。桁数指定なしでも `0.0` / `1.0` は小数 1 桁で出す
//! - `{time}`: 現在のローカル時刻（HH:MM:SS）
//! - `{{` / `}}` で波括弧そのもの
//!
//! 停止判定は「未完了タスク数が 0 になったか」で行う（1 件のタスクだけを見ない）。

use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::app::dispatcher::RunContext;
use crate::domain::EngineError;

/// Decimal places used by `{percent:%}` when no precision is given.
const DEFAULT_PERCENT_PRECISION: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Time,
    Done,
    Total,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct PercentFormat {
    precision: Option<usize>,
    as_percentage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field, PercentFormat),
}

/// Parsed progress-line template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl ReportTemplate {
    pub fn parse(source: &str) -> Result<Self, EngineError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => inner.push(c),
                            None => {
                                return Err(EngineError::InvalidTemplate(format!(
                                    "unclosed `{{` in {source:?}"
                                )));
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_field(&inner)?);
                }
                '}' => {
                    return Err(EngineError::InvalidTemplate(format!(
                        "single `}}` in {source:?}"
                    )));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render(&self, snapshot: &ProgressSnapshot) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(Field::Total, _) => {
                    let _ = write!(out, "{}", snapshot.total);
                }
                Segment::Field(Field::Done, _) => {
                    let _ = write!(out, "{}", snapshot.done);
                }
                Segment::Field(Field::Time, _) => {
                    let _ = write!(out, "{}", snapshot.time.format("%H:%M:%S"));
                }
                Segment::Field(Field::Percent, format) => {
                    render_percent(&mut out, snapshot.fraction(), *format);
                }
            }
        }
        out
    }
}

impl FromStr for ReportTemplate {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(inner: &str) -> Result<Segment, EngineError> {
    let (name, spec) = match inner.split_once(':') {
        Some((name, spec)) => (name, Some(spec)),
        None => (inner, None),
    };
    let field = match name.trim() {
        "time" => Field::Time,
        "done" => Field::Done,
        "total" => Field::Total,
        "percent" => Field::Percent,
        other => {
            return Err(EngineError::InvalidTemplate(format!(
                "unknown field `{other}` (expected time, done, total or percent)"
            )));
        }
    };
    let format = match (field, spec) {
        (_, None) | (_, Some("")) => PercentFormat::default(),
        (Field::Percent, Some(spec)) => parse_percent_spec(spec)?,
        (_, Some(spec)) => {
            return Err(EngineError::InvalidTemplate(format!(
                "field `{name}` does not take a format spec (got `{spec}`)"
            )));
        }
    };
    Ok(Segment::Field(field, format))
}

fn parse_percent_spec(spec: &str) -> Result<PercentFormat, EngineError> {
    let (digits_part, as_percentage) = match spec.strip_suffix('%') {
        Some(rest) => (rest, true),
        None => (spec, false),
    };
    let precision = if digits_part.is_empty() {
        None
    } else {
        let digits = digits_part.strip_prefix('.').ok_or_else(|| {
            EngineError::InvalidTemplate(format!("percent spec must look like `.N` or `.N%`, got `{spec}`"))
        })?;
        Some(digits.parse::<usize>().map_err(|_| {
            EngineError::InvalidTemplate(format!("bad precision in percent spec `{spec}`"))
        })?)
    };
    Ok(PercentFormat {
        precision,
        as_percentage,
    })
}

fn render_percent(out: &mut String, fraction: f64, format: PercentFormat) {
    let _ = match format {
        PercentFormat {
            as_percentage: true,
            precision,
        } => write!(
            out,
            "{:.*}%",
            precision.unwrap_or(DEFAULT_PERCENT_PRECISION),
            fraction * 100.0
        ),
        PercentFormat {
            as_percentage: false,
            precision: Some(p),
        } => write!(out, "{fraction:.p$}"),
        PercentFormat {
            as_percentage: false,
            precision: None,
        } if fraction.fract() == 0.0 => write!(out, "{fraction:.1}"),
        PercentFormat {
            as_percentage: false,
            precision: None,
        } => write!(out, "{fraction}"),
    };
}

/// Values substituted into the template on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub done: usize,
    pub time: DateTime<Local>,
}

impl ProgressSnapshot {
    pub fn now(total: usize, done: usize) -> Self {
        Self {
            total,
            done,
            time: Local::now(),
        }
    }

    /// Completed share of the total, `0.0` for an empty total.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// How the main task stopped waiting for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Every submitted task reached a terminal state.
    Idle,
    ShutdownRequested,
}

/// Template plus polling interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReporter {
    template: ReportTemplate,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(template: &str, seconds: f64) -> Result<Self, EngineError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(EngineError::InvalidInterval(seconds));
        }
        Ok(Self {
            template: ReportTemplate::parse(template)?,
            interval: Duration::from_secs_f64(seconds),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn template(&self) -> &ReportTemplate {
        &self.template
    }

    pub fn render(&self, snapshot: &ProgressSnapshot) -> String {
        self.template.render(snapshot)
    }

    /// Print one line per tick until the pool is idle or shutdown is requested.
    pub(crate) async fn report_until_idle(&self, ctx: &RunContext, total: usize) -> WaitOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.signal.requested() => return WaitOutcome::ShutdownRequested,
                _ = ctx.outstanding.wait_idle() => return WaitOutcome::Idle,
                _ = ticker.tick() => {
                    let snapshot = ProgressSnapshot::now(total, ctx.done.len());
                    println!("{}", self.render(&snapshot));
                }
            }
        }
    }
}
