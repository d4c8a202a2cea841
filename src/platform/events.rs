// src/platform/events.rs

//! Telemetry event sink

use crate::command::ToolCommand;
use tracing::{info, warn};

/// Source name attached to every event
const EVENT_SOURCE: &str = "update-engine";

/// Receives `(event_name, ordered_parameters)` telemetry events
///
/// Emission is best effort; a broken sink must never fail an update.
pub trait EventSink {
    fn emit(&self, name: &str, params: &[String]);
}

/// Make a parameter safe for a single-line event record
pub fn sanitize_param(param: &str) -> String {
    param
        .trim_end()
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// Events delivered through the platform's log-event utility
#[derive(Debug, Clone)]
pub struct LogEventCommand {
    tool: ToolCommand,
}

impl LogEventCommand {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

impl EventSink for LogEventCommand {
    fn emit(&self, name: &str, params: &[String]) {
        let mut args = vec![EVENT_SOURCE.to_string(), name.to_string()];
        args.extend(params.iter().map(|p| sanitize_param(p)));
        if let Err(e) = self.tool.run(&args) {
            warn!("Failed to log event {}: {}", name, e);
        }
    }
}

/// Events written to the tracing log only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn emit(&self, name: &str, params: &[String]) {
        let params: Vec<String> = params.iter().map(|p| sanitize_param(p)).collect();
        info!(event = name, ?params, "telemetry event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_param() {
        assert_eq!(sanitize_param("line one\nline two\r\n"), "line one\\nline two");
        assert_eq!(sanitize_param("plain  "), "plain");
        assert_eq!(sanitize_param(""), "");
    }

    #[test]
    fn test_failed_tool_does_not_panic() {
        let sink = LogEventCommand::new(ToolCommand::new("/nonexistent/vic-log-event"));
        sink.emit("robot.ota_download_start", &[]);
    }
}
