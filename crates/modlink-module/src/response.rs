//! Response sinks handed to capability handlers.

use modlink_peer::{sites_from_value, LogEntry, RelayFile, Severity, Value};

const INVALID_DATA: &str = "return data is not valid";

/// What a handler reports back: log entries plus at most one result.
pub trait Response {
    /// Append a raw entry.
    fn log(&mut self, entry: LogEntry);

    /// Offer the result. Data of the wrong shape adds a `Fatal` entry and
    /// returns `false`.
    fn add_data(&mut self, data: Value) -> bool;

    fn add_debug(&mut self, text: &str) {
        self.log(LogEntry::new(Severity::Debug, text));
    }

    fn add_info(&mut self, text: &str) {
        self.log(LogEntry::new(Severity::Info, text));
    }

    fn add_error(&mut self, text: &str) {
        self.log(LogEntry::new(Severity::Error, text));
    }

    /// Abort the operation on the host side.
    fn add_fatal(&mut self, text: &str) {
        self.log(LogEntry::new(Severity::Fatal, text));
    }
}

/// Result shape a relay category writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayShape {
    /// Raw bytes, stored verbatim (data loaders).
    Bytes,
    /// A string-keyed map (data parsers, data post-processors).
    Map,
    /// A list of sites (site post-processors).
    Sites,
    /// A list of strings (iterators).
    Strings,
}

impl RelayShape {
    fn accepts(self, data: &Value) -> bool {
        match self {
            Self::Bytes => matches!(data, Value::Bytes(_)),
            Self::Map => matches!(data, Value::Map(_)),
            Self::Sites => sites_from_value(data).is_some(),
            Self::Strings => data
                .as_list()
                .is_some_and(|items| items.iter().all(|item| item.as_str().is_some())),
        }
    }
}

/// Sink for categories whose result replaces the relay file's content.
#[derive(Debug)]
pub struct RelayResponse {
    log: Vec<LogEntry>,
    relay: RelayFile,
    shape: RelayShape,
}

impl RelayResponse {
    pub(crate) fn new(relay: RelayFile, shape: RelayShape) -> Self {
        Self {
            log: Vec::new(),
            relay,
            shape,
        }
    }

    pub fn shape(&self) -> RelayShape {
        self.shape
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    pub(crate) fn finish(mut self) -> Vec<LogEntry> {
        self.relay.close();
        self.log
    }
}

impl Response for RelayResponse {
    fn log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    fn add_data(&mut self, data: Value) -> bool {
        if !self.shape.accepts(&data) {
            self.add_fatal(INVALID_DATA);
            return false;
        }
        match self.relay.update(&data) {
            Ok(()) => true,
            Err(err) => {
                self.add_fatal(&format!("failed to update file: {err}"));
                false
            }
        }
    }
}

/// Sink for template functions; the result travels in the response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateFunctionResponse {
    pub data: Value,
    pub log: Vec<LogEntry>,
}

impl TemplateFunctionResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any entry would abort the call on the host.
    pub fn has_fatal(&self) -> bool {
        self.log.iter().any(|entry| entry.severity == Severity::Fatal)
    }
}

impl Response for TemplateFunctionResponse {
    fn log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    fn add_data(&mut self, data: Value) -> bool {
        self.data = data;
        true
    }
}
