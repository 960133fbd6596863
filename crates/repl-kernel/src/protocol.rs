//! Wire protocol spoken between a [`crate::session::Session`] and its child
//! interpreter process.
//!
//! Submissions go out on the child's stdin, one JSON object per line.
//! Everything the child emits comes back multiplexed on its stdout, also one
//! JSON object per line, tagged with a `channel` so the two logical channels
//! described in the design (a shell/control channel for replies, a publish
//! channel for streamed output) share a single pipe without needing a real
//! message bus.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One submission sent to the child's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub kind: &'static str,
    pub msg_id: String,
    pub code: String,
}

impl Submission {
    pub fn execute(msg_id: String, code: String) -> Self {
        Self {
            kind: "execute",
            msg_id,
            code,
        }
    }
}

/// The logical channel a wire message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
}

/// One message as emitted by the child, before correlation filtering.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub channel: Channel,
    pub parent_msg_id: Option<String>,
    pub msg_type: String,
    #[serde(default)]
    pub content: Value,
}

/// One representation of a value: a media type paired with its payload.
///
/// `payload` is left as a `serde_json::Value` rather than a `String` because
/// some media types (notably `application/json`) are naturally structured
/// rather than text, and the interpreter may emit either.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RichResult {
    #[serde(rename = "type")]
    pub media_type: String,
    pub data: Value,
}

/// A user-code error captured from the interpreter, never raised as a Rust
/// error — it is always data inside an [`ExecutionRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteError {
    pub name: String,
    pub value: String,
    pub traceback: Vec<String>,
}

/// The structured outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExecutionRecord {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<ExecuteError>,
    pub results: Vec<RichResult>,
    pub exec_counter: u64,
}

/// Accumulates one execute call's worth of multiplexed messages.
///
/// Owns the correlation filter (§4.3): messages whose `parent_msg_id` does
/// not match the submission that created this assembler are never even
/// reported to the caller as "discarded" — they are simply invisible,
/// exactly mirroring the source's `continue` on mismatch.
pub struct ExecutionAssembler {
    sid: String,
    record: ExecutionRecord,
}

/// Whether the pump driving an [`ExecutionAssembler`] should keep reading.
pub enum PumpControl {
    Continue,
    Stop,
}

impl ExecutionAssembler {
    pub fn new(sid: String, exec_counter: u64) -> Self {
        Self {
            sid,
            record: ExecutionRecord {
                exec_counter,
                ..Default::default()
            },
        }
    }

    /// Folds one wire message into the accumulated record.
    ///
    /// Returns [`PumpControl::Stop`] once a terminal message for this
    /// submission has been seen (`execute_reply`, or `status` idle).
    pub fn handle(&mut self, message: WireMessage) -> PumpControl {
        match &message.parent_msg_id {
            Some(parent) if parent == &self.sid => {}
            _ => return PumpControl::Continue,
        }

        match message.msg_type.as_str() {
            "stream" => {
                let name = message.content.get("name").and_then(Value::as_str);
                let text = message
                    .content
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match name {
                    Some("stderr") => self.record.stderr.push(text),
                    _ => self.record.stdout.push(text),
                }
                PumpControl::Continue
            }
            "error" => {
                let ename = value_str(&message.content, "ename");
                let evalue = value_str(&message.content, "evalue");
                let traceback = message
                    .content
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                self.record.error = Some(ExecuteError {
                    name: ename,
                    value: evalue,
                    traceback,
                });
                PumpControl::Continue
            }
            "execute_result" | "display_data" => {
                if let Some(Value::Object(data)) = message.content.get("data") {
                    append_results(&mut self.record.results, data);
                }
                PumpControl::Continue
            }
            "execute_reply" => PumpControl::Stop,
            "status" => {
                if message.content.get("execution_state").and_then(Value::as_str) == Some("idle") {
                    PumpControl::Stop
                } else {
                    PumpControl::Continue
                }
            }
            _ => PumpControl::Continue,
        }
    }

    /// Consumes the assembler, stripping terminal control sequences from
    /// every text field as the last step before the record is returned to a
    /// caller (invariant: no ANSI escapes ever leave the kernel).
    pub fn finish(self) -> ExecutionRecord {
        let mut record = self.record;
        for line in &mut record.stdout {
            *line = strip_ansi(line);
        }
        for line in &mut record.stderr {
            *line = strip_ansi(line);
        }
        if let Some(error) = &mut record.error {
            error.name = strip_ansi(&error.name);
            error.value = strip_ansi(&error.value);
            for line in &mut error.traceback {
                *line = strip_ansi(line);
            }
        }
        record
    }
}

fn append_results(results: &mut Vec<RichResult>, data: &Map<String, Value>) {
    for (media_type, payload) in data {
        results.push(RichResult {
            media_type: media_type.clone(),
            data: payload.clone(),
        });
    }
}

fn value_str(content: &Value, key: &str) -> String {
    content
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("static ANSI regex"))
}

/// Strips ANSI color/formatting escape sequences, mirroring the `ansi_escape`
/// filter the original sandbox applies to every stream/error field.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(channel: Channel, parent: &str, msg_type: &str, content: Value) -> WireMessage {
        WireMessage {
            channel,
            parent_msg_id: Some(parent.to_string()),
            msg_type: msg_type.to_string(),
            content,
        }
    }

    #[test]
    fn strips_ansi_color_codes() {
        let colored = "\x1b[31mred text\x1b[0m";
        assert_eq!(strip_ansi(colored), "red text");
    }

    #[test]
    fn correlation_filter_drops_foreign_messages() {
        let mut assembler = ExecutionAssembler::new("sid-1".into(), 1);
        let control = assembler.handle(msg(
            Channel::Iopub,
            "sid-0",
            "stream",
            serde_json::json!({"name": "stdout", "text": "intruder"}),
        ));
        assert!(matches!(control, PumpControl::Continue));
        assert!(assembler.finish().stdout.is_empty());
    }

    #[test]
    fn accumulates_stdout_stderr_and_stops_on_idle() {
        let mut assembler = ExecutionAssembler::new("sid-1".into(), 3);
        assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "stream",
            serde_json::json!({"name": "stdout", "text": "hello\n"}),
        ));
        assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "stream",
            serde_json::json!({"name": "stderr", "text": "warn\n"}),
        ));
        let control = assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "status",
            serde_json::json!({"execution_state": "idle"}),
        ));
        assert!(matches!(control, PumpControl::Stop));

        let record = assembler.finish();
        assert_eq!(record.stdout, vec!["hello\n".to_string()]);
        assert_eq!(record.stderr, vec!["warn\n".to_string()]);
        assert_eq!(record.exec_counter, 3);
    }

    #[test]
    fn execute_result_and_display_data_preserve_emission_order() {
        let mut assembler = ExecutionAssembler::new("sid-1".into(), 1);
        assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "display_data",
            serde_json::json!({"data": {"text/plain": "first"}}),
        ));
        assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "execute_result",
            serde_json::json!({"data": {"text/plain": "second"}}),
        ));
        let record = assembler.finish();
        assert_eq!(record.results[0].data, Value::String("first".into()));
        assert_eq!(record.results[1].data, Value::String("second".into()));
    }

    #[test]
    fn error_strips_ansi_from_every_field() {
        let mut assembler = ExecutionAssembler::new("sid-1".into(), 1);
        assembler.handle(msg(
            Channel::Iopub,
            "sid-1",
            "error",
            serde_json::json!({
                "ename": "ZeroDivisionError",
                "evalue": "\x1b[31mdivision by zero\x1b[0m",
                "traceback": ["\x1b[31mTraceback...\x1b[0m"],
            }),
        ));
        let record = assembler.finish();
        let error = record.error.unwrap();
        assert_eq!(error.name, "ZeroDivisionError");
        assert_eq!(error.value, "division by zero");
        assert_eq!(error.traceback, vec!["Traceback...".to_string()]);
    }
}
