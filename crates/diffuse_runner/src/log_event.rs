//! Turns backend output lines into typed events.
//!
//! The backend prints free text. Each complete line is matched against an
//! ordered table of patterns and the first match wins. The parser holds no
//! state between lines; sequencing belongs to the consumer.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

/// Event derived from a single output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum LogEvent {
    /// The HTTP service is listening at this URL.
    ServiceReady(String),
    /// The backend began loading checkpoint weights.
    ModelLoadStarted,
    /// A checkpoint finished loading after this many seconds.
    ModelLoadTiming(f64),
    /// A known fatal load error was printed.
    ModelLoadFailureMarker,
    /// Nothing we act on.
    Unrecognized(String),
}

impl LogEvent {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

type Extractor = fn(&Captures<'_>) -> Option<LogEvent>;

struct Pattern {
    name: &'static str,
    regex: Regex,
    extract: Extractor,
}

/// Source table, in match order.
const PATTERNS: &[(&str, &str, Extractor)] = &[
    (
        "service-ready",
        r"(?i)running on (?:local url:\s*)?(https?://[^\s)]+)",
        extract_service_url,
    ),
    (
        "load-timing",
        r"(?i)(?:model|weights) loaded in (\d+(?:\.\d+)?)s",
        extract_load_seconds,
    ),
    (
        "load-failure",
        r"(?i)(?:TypeError: Cannot convert a MPS Tensor to|Stable diffusion model failed to load)",
        extract_failure,
    ),
    (
        "load-started",
        r"(?i)(?:^\s*loading weights \[[^\]]*\] from\s+\S|reusing loaded model .+ to load )",
        extract_load_started,
    ),
];

fn extract_service_url(caps: &Captures<'_>) -> Option<LogEvent> {
    caps.get(1)
        .map(|m| LogEvent::ServiceReady(m.as_str().trim_end_matches('/').to_string()))
}

fn extract_load_seconds(caps: &Captures<'_>) -> Option<LogEvent> {
    caps.get(1)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(LogEvent::ModelLoadTiming)
}

fn extract_failure(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::ModelLoadFailureMarker)
}

fn extract_load_started(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::ModelLoadStarted)
}

/// Ordered pattern table matcher.
pub struct LogEventParser {
    patterns: Vec<Pattern>,
}

impl std::fmt::Debug for LogEventParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.patterns.iter().map(|p| p.name).collect();
        f.debug_struct("LogEventParser").field("patterns", &names).finish()
    }
}

impl LogEventParser {
    /// Compile the pattern table.
    pub fn new() -> RunnerResult<Self> {
        let patterns = PATTERNS
            .iter()
            .map(|&(name, source, extract)| {
                let regex = Regex::new(source).map_err(|e| RunnerError::InvalidPattern {
                    name,
                    message: e.to_string(),
                })?;
                Ok(Pattern {
                    name,
                    regex,
                    extract,
                })
            })
            .collect::<RunnerResult<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Match one line. Never fails: unmatched text becomes `Unrecognized`.
    pub fn parse(&self, line: &str) -> LogEvent {
        let trimmed = line.trim_end_matches(['\r', '\n']);

        for pattern in &self.patterns {
            if let Some(event) = pattern
                .regex
                .captures(trimmed)
                .and_then(|caps| (pattern.extract)(&caps))
            {
                return event;
            }
        }

        LogEvent::Unrecognized(trimmed.to_string())
    }

    /// Names of the patterns in match order.
    pub fn pattern_names(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|p| p.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LogEventParser {
        LogEventParser::new().unwrap()
    }

    #[test]
    fn test_service_ready() {
        let p = parser();
        assert_eq!(
            p.parse("Running on local URL:  http://127.0.0.1:7860"),
            LogEvent::ServiceReady("http://127.0.0.1:7860".to_string())
        );
        assert_eq!(
            p.parse("INFO:     Uvicorn running on http://127.0.0.1:7861 (Press CTRL+C to quit)"),
            LogEvent::ServiceReady("http://127.0.0.1:7861".to_string())
        );
    }

    #[test]
    fn test_model_load_timing() {
        let p = parser();
        assert_eq!(
            p.parse("Model loaded in 4.6s (load weights from disk: 0.4s, create model: 0.7s)."),
            LogEvent::ModelLoadTiming(4.6)
        );
        assert_eq!(
            p.parse("Weights loaded in 3.5s (send model to cpu: 1.1s, load weights from disk: 0.5s)."),
            LogEvent::ModelLoadTiming(3.5)
        );
        assert_eq!(p.parse("Model loaded in 12s"), LogEvent::ModelLoadTiming(12.0));
    }

    #[test]
    fn test_failure_markers() {
        let p = parser();
        assert_eq!(
            p.parse("TypeError: Cannot convert a MPS Tensor to float64 dtype as the MPS framework doesn't support float64."),
            LogEvent::ModelLoadFailureMarker
        );
        assert_eq!(
            p.parse("Stable diffusion model failed to load"),
            LogEvent::ModelLoadFailureMarker
        );
    }

    #[test]
    fn test_load_started_markers() {
        let p = parser();
        assert_eq!(
            p.parse("Loading weights [6ce0161689] from /models/Stable-diffusion/v1-5-pruned-emaonly.safetensors"),
            LogEvent::ModelLoadStarted
        );
        assert_eq!(
            p.parse("Reusing loaded model a.safetensors [4726d3bab1] to load v1-5.safetensors [6ce0161689]"),
            LogEvent::ModelLoadStarted
        );
    }

    #[test]
    fn test_unrecognized_keeps_line() {
        let p = parser();
        assert_eq!(
            p.parse("Applying attention optimization: sub-quadratic... done.\r"),
            LogEvent::Unrecognized("Applying attention optimization: sub-quadratic... done.".to_string())
        );
        assert!(!p.parse("Startup time: 3.3s").is_recognized());
    }

    #[test]
    fn test_marker_case_does_not_matter() {
        let p = parser();
        assert_eq!(p.parse("MODEL LOADED IN 2.0s"), LogEvent::ModelLoadTiming(2.0));
    }

    #[test]
    fn test_first_match_wins() {
        let p = parser();
        // Both a timing and a failure phrase: timing is earlier in the table.
        assert_eq!(
            p.parse("Model loaded in 1.5s; Stable diffusion model failed to load"),
            LogEvent::ModelLoadTiming(1.5)
        );
        assert_eq!(
            p.pattern_names(),
            vec!["service-ready", "load-timing", "load-failure", "load-started"]
        );
    }
}
