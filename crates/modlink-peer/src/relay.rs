//! Bulk data exchange through temporary files.
//!
//! Large payloads never cross the protocol stream. The pipeline initiator
//! creates a relay file, passes its path (the *reference*) as a call
//! argument, and every handler along the pipeline imports that path and
//! rewrites the content in place. The initiator reads the final value and
//! cleans the file up.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::error::RelayError;
use crate::value::Value;

/// Prefix marking content written through the codec. Anything else is raw.
const ENCODED_MARKER: &[u8] = b"\0modlink-value\n";

static DEFAULT_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Where relay files are created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Overrides `<tmp>/modlink/relay`.
    pub root: Option<PathBuf>,
}

/// A directory holding relay files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoot {
    path: PathBuf,
}

impl RelayRoot {
    /// The process-wide root under the system temp directory, created on
    /// first use.
    pub fn shared() -> Result<Self, RelayError> {
        if let Some(path) = DEFAULT_ROOT.get() {
            return Ok(Self { path: path.clone() });
        }
        let path = std::env::temp_dir().join("modlink").join("relay");
        std::fs::create_dir_all(&path)?;
        debug!(root = %path.display(), "created relay root");
        Ok(Self {
            path: DEFAULT_ROOT.get_or_init(|| path).clone(),
        })
    }

    /// Root at `path`, created if missing.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        match &config.root {
            Some(path) => Self::at(path.clone()),
            None => Self::shared(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One relay file, open for reading and writing.
#[derive(Debug)]
pub struct RelayFile {
    codec: PayloadCodec,
    path: PathBuf,
    file: Option<File>,
}

impl RelayFile {
    /// Create a file under the shared root, optionally seeded with `initial`.
    pub fn create(codec: PayloadCodec, initial: Option<&Value>) -> Result<Self, RelayError> {
        Self::create_in(&RelayRoot::shared()?, codec, initial)
    }

    pub fn create_in(
        root: &RelayRoot,
        codec: PayloadCodec,
        initial: Option<&Value>,
    ) -> Result<Self, RelayError> {
        let (file, path) = tempfile::Builder::new()
            .prefix("relay-")
            .tempfile_in(root.path())?
            .keep()
            .map_err(|err| RelayError::Io(err.error))?;

        let mut relay = Self {
            codec,
            path,
            file: Some(file),
        };
        if let Some(value) = initial {
            relay.update(value)?;
        }
        debug!(reference = %relay.reference(), "created relay file");
        Ok(relay)
    }

    /// Create a file under the shared root holding `bytes` verbatim.
    pub fn create_raw(codec: PayloadCodec, bytes: &[u8]) -> Result<Self, RelayError> {
        let mut relay = Self::create(codec, None)?;
        relay.update_raw(bytes)?;
        Ok(relay)
    }

    /// Open an existing relay file by reference.
    pub fn import(codec: PayloadCodec, reference: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = reference.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            codec,
            path,
            file: Some(file),
        })
    }

    /// Replace the content with `value`.
    ///
    /// Bytes are stored raw unless they begin with the encoding marker, in
    /// which case they are encoded so `retrieve` returns them unchanged.
    pub fn update(&mut self, value: &Value) -> Result<(), RelayError> {
        if let Value::Bytes(bytes) = value {
            if !bytes.starts_with(ENCODED_MARKER) {
                return self.update_raw(bytes);
            }
        }
        let mut content = ENCODED_MARKER.to_vec();
        content.extend(self.codec.encode_value(value)?);
        self.rewrite(&content)
    }

    /// Replace the content with `bytes` verbatim. Content that begins with
    /// the encoding marker is decoded by `retrieve`.
    pub fn update_raw(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.rewrite(bytes)
    }

    /// Current content. Raw content comes back as [`Value::Bytes`].
    pub fn retrieve(&mut self) -> Result<Value, RelayError> {
        let content = self.retrieve_raw()?;
        match content.strip_prefix(ENCODED_MARKER) {
            Some(encoded) => Ok(self.codec.decode_value(encoded)?),
            None => Ok(Value::Bytes(content)),
        }
    }

    /// Current content as stored on disk.
    pub fn retrieve_raw(&mut self) -> Result<Vec<u8>, RelayError> {
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(0))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Release the descriptor and keep the file.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Release the descriptor and delete the file.
    pub fn cleanup(&mut self) -> Result<(), RelayError> {
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(reference = %self.reference(), "removed relay file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(reference = %self.reference(), "relay file already removed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The path string passed across the wire.
    pub fn reference(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn rewrite(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn open_file(&mut self) -> Result<&mut File, RelayError> {
        let reference = self.reference();
        self.file.as_mut().ok_or(RelayError::Closed(reference))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::site::Site;

    fn root() -> (tempfile::TempDir, RelayRoot) {
        let dir = tempfile::tempdir().unwrap();
        let root = RelayRoot::at(dir.path().join("relay")).unwrap();
        (dir, root)
    }

    fn sample_map() -> Value {
        let mut map = BTreeMap::new();
        map.insert("testdata".to_string(), Value::from("hey"));
        Value::Map(map)
    }

    #[test]
    fn create_then_retrieve() {
        let (_dir, root) = root();
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), Some(&sample_map())).unwrap();
        assert_eq!(relay.retrieve().unwrap(), sample_map());
        assert!(relay.path().starts_with(root.path()));
    }

    #[test]
    fn update_replaces_content() {
        let (_dir, root) = root();
        let mut relay =
            RelayFile::create_in(&root, PayloadCodec::builtin(), Some(&Value::from("a much longer first value")))
                .unwrap();
        relay.update(&Value::Int(2)).unwrap();

        assert_eq!(relay.retrieve().unwrap(), Value::Int(2));
        assert_eq!(relay.retrieve().unwrap(), Value::Int(2));
    }

    #[test]
    fn raw_bytes_bypass_the_codec() {
        let (_dir, root) = root();
        let raw = br#"{"testdata":"hey"}"#;
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), None).unwrap();
        relay.update(&Value::bytes(raw.to_vec())).unwrap();

        assert_eq!(relay.retrieve_raw().unwrap(), raw.to_vec());
        assert_eq!(relay.retrieve().unwrap(), Value::bytes(raw.to_vec()));
    }

    #[test]
    fn bytes_that_look_encoded_come_back_unchanged() {
        let (_dir, root) = root();
        let mut tricky = ENCODED_MARKER.to_vec();
        tricky.extend_from_slice(b"\"not a value\"");
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), None).unwrap();

        relay.update(&Value::bytes(tricky.clone())).unwrap();
        assert_eq!(relay.retrieve().unwrap(), Value::bytes(tricky.clone()));

        relay.update(&Value::bytes(ENCODED_MARKER.to_vec())).unwrap();
        assert_eq!(relay.retrieve().unwrap(), Value::bytes(ENCODED_MARKER.to_vec()));
    }

    #[test]
    fn empty_file_is_empty_bytes() {
        let (_dir, root) = root();
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), None).unwrap();
        assert_eq!(relay.retrieve().unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn import_sees_updates_from_other_handle() {
        let (_dir, root) = root();
        let mut origin = RelayFile::create_in(&root, PayloadCodec::builtin(), None).unwrap();
        let mut imported = RelayFile::import(PayloadCodec::builtin(), origin.reference()).unwrap();

        let sites = crate::site::sites_to_value(&[Site::new("/", "index.html")]);
        imported.update(&sites).unwrap();
        imported.close();

        assert_eq!(origin.retrieve().unwrap(), sites);
    }

    #[test]
    fn cleanup_then_retrieve_fails() {
        let (_dir, root) = root();
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), Some(&Value::Int(1))).unwrap();
        let path = relay.path().to_path_buf();

        relay.cleanup().unwrap();
        assert!(!path.exists());
        assert!(matches!(relay.retrieve(), Err(RelayError::Closed(_))));
        assert!(matches!(relay.retrieve_raw(), Err(RelayError::Closed(_))));
        assert!(RelayFile::import(PayloadCodec::builtin(), &path).is_err());
    }

    #[test]
    fn close_keeps_file() {
        let (_dir, root) = root();
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), Some(&Value::Bool(true))).unwrap();
        relay.close();
        assert!(!relay.is_open());
        assert!(relay.path().exists());

        let mut reopened = RelayFile::import(PayloadCodec::builtin(), relay.path()).unwrap();
        assert_eq!(reopened.retrieve().unwrap(), Value::Bool(true));
    }

    #[test]
    fn unregistered_type_cannot_be_stored() {
        let (_dir, root) = root();
        let mut relay = RelayFile::create_in(&root, PayloadCodec::builtin(), None).unwrap();
        let err = relay.update(&Value::typed("widget", Value::Null)).unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
    }

    #[test]
    fn names_are_unique() {
        let (_dir, root) = root();
        let refs: std::collections::HashSet<String> = (0..64)
            .map(|_| {
                RelayFile::create_in(&root, PayloadCodec::builtin(), None)
                    .unwrap()
                    .reference()
            })
            .collect();
        assert_eq!(refs.len(), 64);
    }

    #[test]
    fn shared_root_is_stable() {
        let first = RelayRoot::shared().unwrap();
        let second = RelayRoot::from_config(&RelayConfig::default()).unwrap();
        assert_eq!(first, second);
        assert!(first.path().is_dir());
    }
}
