use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Command asking a module for its capability table.
pub const GET_METHODS: &str = "getMethods";
/// Command asking a module's dispatch loop to stop.
pub const KILL: &str = "KILL";
/// Command carrying the host's protocol version during the handshake.
pub const GET_VERSION: &str = "getVersion";
/// Command delivering host configuration to a module.
pub const INTERNAL_CONFIG: &str = "internal_config";
/// Command running every template function's self-test.
pub const INTERNAL_TEST_METHODS: &str = "internal_testMethods";

/// Text of the log entry a module answers `internal_config` with when it
/// has nothing to configure.
pub const MODULE_READY: &str = "module: ready";

/// Category prefix reserved for commands the dispatcher handles itself.
pub const INTERNAL_CATEGORY: &str = "internal";

/// Random 10-byte token pairing a response with its request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CorrelationId(pub [u8; 10]);

/// Reserved id of the version handshake. Never produced by [`CorrelationId::random`].
pub const HANDSHAKE_ID: CorrelationId = CorrelationId([1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

impl CorrelationId {
    /// All-zero id carried by synthesized failure responses.
    pub const ZERO: CorrelationId = CorrelationId([0; 10]);

    /// Draw a fresh id from the OS randomness source.
    pub fn random() -> Result<Self, rand::Error> {
        loop {
            let mut bytes = [0u8; 10];
            OsRng.try_fill_bytes(&mut bytes)?;
            let id = Self(bytes);
            if id != HANDSHAKE_ID && id != Self::ZERO {
                return Ok(id);
            }
        }
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// What a message carries besides its command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    GetMethods,
    Kill,
    Version(u32),
    Execute { args: Vec<Value> },
}

impl Payload {
    /// Arguments as the module-side token sees them.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Self::GetMethods | Self::Kill => Vec::new(),
            Self::Version(version) => vec![Value::Int(i64::from(version))],
            Self::Execute { args } => args,
        }
    }
}

/// A host-to-module request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: String,
    pub payload: Payload,
    pub id: CorrelationId,
}

/// A module-to-host answer to one [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub data: Value,
    pub log: Vec<LogEntry>,
}

impl Response {
    /// Stand-in for a response that could not be read.
    pub fn protocol_failure(id: CorrelationId, text: impl Into<String>) -> Self {
        Self {
            id,
            data: Value::Null,
            log: vec![LogEntry::new(Severity::ProtocolFailure, text)],
        }
    }

    /// Entries that make the call count as failed.
    pub fn failures(&self) -> impl Iterator<Item = &LogEntry> {
        self.log.iter().filter(|entry| entry.is_failure())
    }

    pub fn is_failure(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// How serious a log entry is.
///
/// Only `Fatal` and `ProtocolFailure` abort the logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Fatal,
    Error,
    Info,
    Debug,
    ProtocolFailure,
    InvalidResponse,
}

impl Severity {
    pub fn is_aborting(self) -> bool {
        matches!(self, Self::Fatal | Self::ProtocolFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::ProtocolFailure => "protocol-failure",
            Self::InvalidResponse => "invalid-response",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure the dispatcher itself detected before or around a handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fault {
    InvalidCommand,
    InvalidInput,
    Failed,
    NoConfig,
}

impl Fault {
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidCommand => "module: the provided command does not exist",
            Self::InvalidInput => "module: the provided data is invalid",
            Self::Failed => "module: internal processing errors",
            Self::NoConfig => "module: config has not been received yet",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One diagnostic attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub text: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl LogEntry {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity,
            fault: None,
        }
    }

    /// An `Error` entry tagged with `fault`, optionally with extra detail.
    pub fn fault(fault: Fault, detail: Option<&str>) -> Self {
        let text = match detail {
            Some(detail) => format!("{}: {detail}", fault.message()),
            None => fault.message().to_string(),
        };
        Self {
            text,
            severity: Severity::Error,
            fault: Some(fault),
        }
    }

    /// Aborting severity or a dispatcher fault.
    pub fn is_failure(&self) -> bool {
        self.severity.is_aborting() || self.fault.is_some()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.text)
    }
}

/// Capability categories a module can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    TemplateFunctions,
    DataLoaders,
    DataParsers,
    DataPostProcessors,
    SitePostProcessors,
    Iterators,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::TemplateFunctions,
        Category::DataLoaders,
        Category::DataParsers,
        Category::DataPostProcessors,
        Category::SitePostProcessors,
        Category::Iterators,
    ];

    /// Wire key, also the command prefix.
    pub fn key(self) -> &'static str {
        match self {
            Self::TemplateFunctions => "templateFunctions",
            Self::DataLoaders => "dataLoaders",
            Self::DataParsers => "dataParsers",
            Self::DataPostProcessors => "dataPostProcessors",
            Self::SitePostProcessors => "sitePostProcessors",
            Self::Iterators => "iterators",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.key() == key)
    }

    /// `"<category>_<identifier>"`.
    pub fn command(self, identifier: &str) -> String {
        format!("{}_{identifier}", self.key())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Split a command on its first `_` into `(category, identifier)`.
pub fn split_command(command: &str) -> Option<(&str, &str)> {
    command.split_once('_')
}

/// Category key to sorted identifiers.
pub type Methods = BTreeMap<String, Vec<String>>;

pub fn methods_to_value(methods: &Methods) -> Value {
    Value::Map(
        methods
            .iter()
            .map(|(category, identifiers)| {
                let list = identifiers.iter().map(|id| Value::from(id.as_str())).collect();
                (category.clone(), Value::List(list))
            })
            .collect(),
    )
}

/// Parse a methods table, or `None` if `value` does not have that shape.
pub fn methods_from_value(value: &Value) -> Option<Methods> {
    let mut methods = Methods::new();
    for (category, identifiers) in value.as_map()? {
        let identifiers = identifiers
            .as_list()?
            .iter()
            .map(|id| id.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        methods.insert(category.clone(), identifiers);
    }
    Some(methods)
}
