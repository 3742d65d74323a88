// Rendering of command results and diagnostics.
//
// Results go to stdout: plain text on a terminal, one JSON object per line
// when piped or with `--json`. Errors and warnings go to stderr in the same
// format so scripts can parse both streams.

use std::io::{self, IsTerminal, Write};

use redmap_core::{ConfigError, MapError};
use serde::Serialize;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a terminal.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Print a command result to stdout; `human_fn` renders the terminal form.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let line = match format {
        OutputFormat::Human => human_fn(value),
        OutputFormat::Json => serde_json::to_string(value).map_err(io::Error::other)?,
    };
    writeln!(io::stdout().lock(), "{line}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Error => ANSI_RED,
            Self::Warning => ANSI_YELLOW,
        }
    }
}

/// One stderr line for a diagnostic. JSON lines look like
/// `{"error":{"code":"...","message":"..."}}`.
fn render_diagnostic(
    severity: Severity,
    format: OutputFormat,
    code: &str,
    message: &str,
    is_tty: bool,
) -> String {
    let label = severity.label();
    match format {
        OutputFormat::Human if is_tty => {
            format!("{}{label}:{ANSI_RESET} {message}", severity.color())
        }
        OutputFormat::Human => format!("{label}: {message}"),
        OutputFormat::Json => {
            let mut root = serde_json::Map::new();
            root.insert(label.to_string(), serde_json::json!({ "code": code, "message": message }));
            serde_json::Value::Object(root).to_string()
        }
    }
}

fn print_diagnostic(severity: Severity, format: OutputFormat, code: &str, message: &str) {
    let line = render_diagnostic(severity, format, code, message, io::stderr().is_terminal());
    let _ = writeln!(io::stderr().lock(), "{line}");
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(Severity::Error, format, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(Severity::Warning, format, code, message);
}

/// Print a command failure with a code and a hint derived from its cause.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    for cause in error.chain() {
        if let Some(map_error) = cause.downcast_ref::<MapError>() {
            return match map_error {
                MapError::StoreUnavailable(_) => (
                    "STORE_UNAVAILABLE",
                    format!("{message}. Check that Redis is running, or pass --url / set REDMAP_URL"),
                ),
                MapError::Timeout { .. } => (
                    "STORE_TIMEOUT",
                    format!("{message}. Raise command_timeout_ms if the server is just slow"),
                ),
                MapError::SubscriptionFailure { .. } => ("SUBSCRIPTION_FAILED", message),
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return (
                "INVALID_CONFIG",
                format!("{message}. Check ~/.redmap/config.toml and REDMAP_* variables"),
            );
        }
    }

    ("ERROR", message)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Context;

    use super::*;

    #[test]
    fn terminal_gets_human_and_pipe_gets_json() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn timeout_chain_renders_as_json_error() {
        let err: anyhow::Result<()> = Err(MapError::Timeout {
            command: "HGETALL",
            timeout: Duration::from_millis(2000),
        })
        .context("failed to list entries");
        let err = err.unwrap_err();
        let (code, message) = actionable_error(&err);

        let line = render_diagnostic(Severity::Error, OutputFormat::Json, code, &message, false);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["error"]["code"], "STORE_TIMEOUT");
        let text = parsed["error"]["message"].as_str().unwrap();
        assert!(text.starts_with("failed to list entries: store command `HGETALL` timed out"));
        assert!(text.contains("command_timeout_ms"));
    }

    #[test]
    fn degraded_liveness_warning_as_json() {
        let line = render_diagnostic(
            Severity::Warning,
            OutputFormat::Json,
            "LIVENESS_DEGRADED",
            "could not subscribe to `orders`",
            true,
        );
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["warning"]["code"], "LIVENESS_DEGRADED");
        assert!(parsed.get("error").is_none());
    }

    #[test]
    fn human_diagnostics_are_colored_only_on_a_terminal() {
        let colored =
            render_diagnostic(Severity::Error, OutputFormat::Human, "ERROR", "boom", true);
        assert_eq!(colored, format!("{ANSI_RED}error:{ANSI_RESET} boom"));
        let plain = render_diagnostic(Severity::Warning, OutputFormat::Human, "W", "careful", false);
        assert_eq!(plain, "warning: careful");
    }

    #[test]
    fn store_unavailable_points_at_connection_settings() {
        let err = anyhow::Error::new(MapError::unavailable("connection refused"))
            .context("failed to connect to redis at localhost:6379");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "STORE_UNAVAILABLE");
        assert!(message.contains("localhost:6379"));
        assert!(message.contains("REDMAP_URL"));
    }

    #[test]
    fn bad_url_is_a_config_error() {
        let err = anyhow::Error::new(ConfigError::InvalidUrl {
            url: "http://x".into(),
            reason: "scheme must be redis://".into(),
        });
        assert_eq!(actionable_error(&err).0, "INVALID_CONFIG");
    }

    #[test]
    fn unrelated_errors_keep_their_message() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(actionable_error(&err), ("ERROR", "something else".to_string()));
    }
}
