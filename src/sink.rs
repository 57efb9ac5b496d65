//! JSON Lines output for service events
//!
//! Each event becomes one line tagged with the owning user:
//! ```json
//! {"user":"alice","type":"LIST_DIFF","diff":{...},"id":1700000000000}
//! ```

use std::io::{self, Write};

use parking_lot::Mutex;
use serde::Serialize;

use crate::events::ServiceEvent;

#[derive(Serialize)]
struct UserEvent<'a> {
    user: &'a str,
    #[serde(flatten)]
    event: &'a ServiceEvent,
}

/// Writes events as JSON lines to any writer (stdout for the daemon)
pub struct EventSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl EventSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> EventSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn emit(&self, user: &str, event: &ServiceEvent) {
        let line = match serde_json::to_string(&UserEvent { user, event }) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Dropping unserializable {} event: {}", event.name(), e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        // Ignore write errors (reader may have gone away)
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_tagged() {
        let sink = EventSink::new(Vec::new());
        sink.emit("alice", &ServiceEvent::ConnectionStateChange { connected: false });
        sink.emit("bob", &ServiceEvent::ConnectionStateChange { connected: true });

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["user"], "alice");
        assert_eq!(lines[0]["type"], "CONNECTION_STATE_CHANGE");
        assert_eq!(lines[0]["connected"], false);
        assert_eq!(lines[1]["user"], "bob");
    }
}
