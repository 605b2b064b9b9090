//! Telemetry sinks for completed lines.
//!
//! The server hands every completed line to a sink together with the
//! property name it should be reported under. Delivery is fire-and-forget:
//! sinks handle their own failures and never push back on the server.

use crate::config::SinkKind;
use std::io::{self, Write};
use tracing::{info, warn};

/// Destination for completed lines.
pub trait TelemetrySink {
    /// Forward one line reported under `tag`.
    fn forward_line(&mut self, tag: &str, line: &str);
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Box<T> {
    fn forward_line(&mut self, tag: &str, line: &str) {
        (**self).forward_line(tag, line)
    }
}

/// Emits each line as a structured log event on the `telemetry` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn forward_line(&mut self, tag: &str, line: &str) {
        info!(target: "telemetry", property = tag, value = line, "Reported property");
    }
}

/// Writes each line as a one-property JSON object, one object per line:
/// `{"sendToCloud":"hello"}`.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, tag: &str, line: &str) -> io::Result<()> {
        let mut record = serde_json::Map::new();
        record.insert(tag.to_string(), serde_json::Value::from(line));
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    fn forward_line(&mut self, tag: &str, line: &str) {
        if let Err(e) = self.write_record(tag, line) {
            warn!(property = tag, error = %e, "Failed to forward line");
        }
    }
}

/// Build the sink selected by configuration.
pub fn build_sink(kind: SinkKind) -> Box<dyn TelemetrySink> {
    match kind {
        SinkKind::Log => Box::new(TracingSink),
        SinkKind::Stdout => Box::new(JsonLinesSink::new(io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_shape() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.forward_line("sendToCloud", "hello");
        sink.forward_line("sendToCloud", "say \"hi\"");

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"sendToCloud":"hello"}"#);

        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["sendToCloud"], "say \"hi\"");
    }

    #[test]
    fn test_json_lines_write_failure_is_swallowed() {
        struct BrokenWriter;

        impl Write for BrokenWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = JsonLinesSink::new(BrokenWriter);
        sink.forward_line("sendToCloud", "lost");
    }

    #[test]
    fn test_boxed_sink_forwards() {
        let mut sink: Box<dyn TelemetrySink> = Box::new(TracingSink);
        sink.forward_line("sendToCloud", "hello");
    }
}
