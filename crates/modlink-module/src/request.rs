//! Typed handler inputs and the builders that derive them from call
//! arguments.
//!
//! Relay categories take `[fileRef, variable]`. A malformed argument list is
//! rejected with [`Fault::InvalidInput`]; a relay file that cannot be opened
//! or read is rejected with [`Fault::Failed`].

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use modlink_peer::{sites_from_value, Fault, LogEntry, PayloadCodec, RelayFile, Site, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLoaderRequest {
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataParserRequest {
    /// Raw bytes left in the relay file by the loader.
    pub data: Vec<u8>,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataPostProcessorRequest {
    pub data: BTreeMap<String, Value>,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SitePostProcessorRequest {
    pub sites: Vec<Site>,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorRequest {
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateFunctionRequest {
    pub data: Vec<Value>,
}

/// Opens relay files named in call arguments.
#[derive(Debug, Clone)]
pub(crate) struct RelayOpener {
    codec: PayloadCodec,
    root: Option<PathBuf>,
}

impl RelayOpener {
    pub(crate) fn new(codec: PayloadCodec, root: Option<PathBuf>) -> Self {
        Self { codec, root }
    }

    fn open(&self, reference: &str) -> Result<RelayFile, LogEntry> {
        let path = Path::new(reference);
        if let Some(root) = &self.root {
            if !within(root, path) {
                return Err(LogEntry::fault(
                    Fault::Failed,
                    Some(&format!("{reference} is outside the relay root")),
                ));
            }
        }
        RelayFile::import(self.codec.clone(), path).map_err(|err| {
            debug!(reference, error = %err, "failed to open relay file");
            LogEntry::fault(Fault::Failed, Some(&err.to_string()))
        })
    }
}

/// True when `path` resolves to a location under `root`.
fn within(root: &Path, path: &Path) -> bool {
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return false;
    }
    // Resolve symlinks on both sides before comparing.
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}

fn invalid(detail: &str) -> LogEntry {
    LogEntry::fault(Fault::InvalidInput, Some(detail))
}

fn failed(detail: String) -> LogEntry {
    LogEntry::fault(Fault::Failed, Some(&detail))
}

/// `[fileRef, variable]`, both strings.
fn relay_args(data: &[Value]) -> Result<(&str, String), LogEntry> {
    let [reference, variable] = data else {
        return Err(invalid(&format!(
            "expected [fileRef, variable], got {} arguments",
            data.len()
        )));
    };
    let reference = reference
        .as_str()
        .ok_or_else(|| invalid(&format!("fileRef must be a string, got {}", reference.kind())))?;
    let variable = variable
        .as_str()
        .ok_or_else(|| invalid(&format!("variable must be a string, got {}", variable.kind())))?;
    Ok((reference, variable.to_string()))
}

fn read(relay: &mut RelayFile) -> Result<Value, LogEntry> {
    relay.retrieve().map_err(|err| failed(err.to_string()))
}

pub(crate) fn data_loader(
    data: &[Value],
    opener: &RelayOpener,
) -> Result<(DataLoaderRequest, RelayFile), LogEntry> {
    let (reference, variable) = relay_args(data)?;
    let relay = opener.open(reference)?;
    Ok((DataLoaderRequest { variable }, relay))
}

pub(crate) fn data_parser(
    data: &[Value],
    opener: &RelayOpener,
) -> Result<(DataParserRequest, RelayFile), LogEntry> {
    let (reference, variable) = relay_args(data)?;
    let mut relay = opener.open(reference)?;
    let data = match read(&mut relay)? {
        Value::Bytes(bytes) => bytes,
        Value::String(text) => text.into_bytes(),
        other => return Err(failed(format!("relay holds {}, not bytes", other.kind()))),
    };
    Ok((DataParserRequest { data, variable }, relay))
}

pub(crate) fn data_post_processor(
    data: &[Value],
    opener: &RelayOpener,
) -> Result<(DataPostProcessorRequest, RelayFile), LogEntry> {
    let (reference, variable) = relay_args(data)?;
    let mut relay = opener.open(reference)?;
    let data = match read(&mut relay)? {
        Value::Map(map) => map,
        other => return Err(failed(format!("relay holds {}, not a map", other.kind()))),
    };
    Ok((DataPostProcessorRequest { data, variable }, relay))
}

pub(crate) fn site_post_processor(
    data: &[Value],
    opener: &RelayOpener,
) -> Result<(SitePostProcessorRequest, RelayFile), LogEntry> {
    let (reference, variable) = relay_args(data)?;
    let mut relay = opener.open(reference)?;
    let content = read(&mut relay)?;
    let sites = sites_from_value(&content)
        .ok_or_else(|| failed(format!("relay holds {}, not a site list", content.kind())))?;
    Ok((SitePostProcessorRequest { sites, variable }, relay))
}

pub(crate) fn iterator(
    data: &[Value],
    opener: &RelayOpener,
) -> Result<(IteratorRequest, RelayFile), LogEntry> {
    let (reference, variable) = relay_args(data)?;
    let relay = opener.open(reference)?;
    Ok((IteratorRequest { variable }, relay))
}

pub(crate) fn template_function(data: Vec<Value>) -> TemplateFunctionRequest {
    TemplateFunctionRequest { data }
}
