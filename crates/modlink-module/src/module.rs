use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use modlink_peer::{
    handshake_module, methods_to_value, split_command, Category, Connection, Fault, LogEntry,
    Methods, PayloadCodec, PeerError, RelayFile, Severity, Token, Value, GET_METHODS,
    INTERNAL_CATEGORY, KILL, MODULE_READY,
};
use tracing::{debug, error, info, warn};

use crate::config::ModuleConfig;
use crate::error::{RegistrationError, Result};
use crate::registry::{self, ConfigFunctionHandler, Fixture, Registry};
use crate::request::{
    self, DataLoaderRequest, DataParserRequest, DataPostProcessorRequest, IteratorRequest,
    RelayOpener, SitePostProcessorRequest, TemplateFunctionRequest,
};
use crate::response::{RelayResponse, RelayShape, TemplateFunctionResponse};
use crate::selftest::run_fixtures;

/// Exit code used by [`Module::abort_on_error`].
pub const REGISTRATION_EXIT_CODE: i32 = 78;

/// Why the dispatch loop stopped.
#[derive(Debug)]
pub enum ExitReason {
    /// The host sent `KILL`.
    Killed,
    /// The stream closed or could not be read.
    EndOfStream,
    /// The version handshake failed; no command was served.
    Handshake(PeerError),
}

/// A module: a named set of capability handlers served over one stream.
pub struct Module {
    name: String,
    config: ModuleConfig,
    registry: Registry,
    config_function: Option<ConfigFunctionHandler>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_config(name, ModuleConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ModuleConfig) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        Ok(Self {
            name,
            config,
            registry: Registry::default(),
            config_function: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// The capability table as `getMethods` reports it.
    pub fn methods(&self) -> Methods {
        self.registry.methods()
    }

    pub fn register_data_loader(
        &mut self,
        identifier: &str,
        handler: impl Fn(DataLoaderRequest, &mut RelayResponse) + Send + 'static,
    ) -> Result<()> {
        registry::insert(
            &mut self.registry.data_loaders,
            Category::DataLoaders,
            identifier,
            Box::new(handler),
        )
    }

    pub fn register_data_parser(
        &mut self,
        identifier: &str,
        handler: impl Fn(DataParserRequest, &mut RelayResponse) + Send + 'static,
    ) -> Result<()> {
        registry::insert(
            &mut self.registry.data_parsers,
            Category::DataParsers,
            identifier,
            Box::new(handler),
        )
    }

    pub fn register_data_post_processor(
        &mut self,
        identifier: &str,
        handler: impl Fn(DataPostProcessorRequest, &mut RelayResponse) + Send + 'static,
    ) -> Result<()> {
        registry::insert(
            &mut self.registry.data_post_processors,
            Category::DataPostProcessors,
            identifier,
            Box::new(handler),
        )
    }

    pub fn register_site_post_processor(
        &mut self,
        identifier: &str,
        handler: impl Fn(SitePostProcessorRequest, &mut RelayResponse) + Send + 'static,
    ) -> Result<()> {
        registry::insert(
            &mut self.registry.site_post_processors,
            Category::SitePostProcessors,
            identifier,
            Box::new(handler),
        )
    }

    pub fn register_iterator(
        &mut self,
        identifier: &str,
        handler: impl Fn(IteratorRequest, &mut RelayResponse) + Send + 'static,
    ) -> Result<()> {
        registry::insert(
            &mut self.registry.iterators,
            Category::Iterators,
            identifier,
            Box::new(handler),
        )
    }

    /// Register a template function with the fixture `internal_testMethods`
    /// runs it against.
    pub fn register_template_function(
        &mut self,
        identifier: &str,
        handler: impl Fn(TemplateFunctionRequest, &mut TemplateFunctionResponse) + Send + 'static,
        fixture: Fixture,
    ) -> Result<()> {
        self.registry
            .insert_template_function(identifier, Box::new(handler), fixture)
    }

    /// Register the single function that receives `internal_config`.
    pub fn register_config_function(
        &mut self,
        handler: impl FnMut(&BTreeMap<String, Value>) -> std::result::Result<(), String>
            + Send
            + 'static,
    ) -> Result<()> {
        if self.config_function.is_some() {
            return Err(RegistrationError::Duplicate {
                category: INTERNAL_CATEGORY,
                identifier: "config".to_string(),
            });
        }
        self.config_function = Some(Box::new(handler));
        Ok(())
    }

    /// Unwrap a registration result, or log the reason and exit the process.
    ///
    /// Meant for module binaries, where a broken capability table is a
    /// startup bug.
    pub fn abort_on_error<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "module registration failed");
                eprintln!("module registration failed: {err}");
                std::process::exit(REGISTRATION_EXIT_CODE);
            }
        }
    }

    /// Serve the host over stdin/stdout.
    ///
    /// Returns when the host sends `KILL`. Any other end of the loop exits
    /// the process with status 1.
    pub fn start(mut self) {
        match self.custom_start(std::io::stdin(), std::io::stdout()) {
            ExitReason::Killed => {}
            reason => {
                error!(module = %self.name, ?reason, "module stopped");
                std::process::exit(1);
            }
        }
    }

    /// Serve the host over an arbitrary stream pair.
    pub fn custom_start(
        &mut self,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> ExitReason {
        let codec = PayloadCodec::new(Arc::clone(&self.config.registry));
        let connection =
            Connection::open_with_config(reader, writer, codec.clone(), self.config.frame.clone());

        if let Err(err) = handshake_module(&connection, &self.config.handshake) {
            error!(module = %self.name, error = %err, "handshake failed");
            return ExitReason::Handshake(err);
        }
        info!(module = %self.name, "module serving");

        let opener = RelayOpener::new(codec, self.config.relay.root.clone());
        loop {
            let token = connection.receive();
            if token.is_end_of_stream() {
                debug!(module = %self.name, "host closed the stream");
                return ExitReason::EndOfStream;
            }
            if token.command == KILL {
                info!(module = %self.name, "killed by host");
                return ExitReason::Killed;
            }
            self.dispatch(token, &opener);
        }
    }

    fn dispatch(&mut self, mut token: Token<'_>, opener: &RelayOpener) {
        let command = token.command.clone();
        debug!(module = %self.name, %command, id = %token.id, "dispatching");

        if command == GET_METHODS {
            respond(token, &methods_to_value(&self.methods()), &[]);
            return;
        }

        let Some((category, identifier)) = split_command(&command) else {
            reject(token, Fault::InvalidCommand, &command);
            return;
        };
        let data = std::mem::take(&mut token.data);

        if category == INTERNAL_CATEGORY {
            self.internal(token, identifier, data);
            return;
        }
        let Some(category) = Category::from_key(category) else {
            reject(token, Fault::InvalidCommand, &command);
            return;
        };

        let registry = &self.registry;
        match category {
            Category::TemplateFunctions => {
                let Some(entry) = registry.template_functions.get(identifier) else {
                    reject(token, Fault::InvalidCommand, &command);
                    return;
                };
                let mut response = TemplateFunctionResponse::new();
                (entry.handler)(request::template_function(data), &mut response);
                respond(token, &response.data, &response.log);
            }
            Category::DataLoaders => run_relay(
                token,
                registry.data_loaders.get(identifier).map(|handler| &**handler),
                || request::data_loader(&data, opener),
                RelayShape::Bytes,
            ),
            Category::DataParsers => run_relay(
                token,
                registry.data_parsers.get(identifier).map(|handler| &**handler),
                || request::data_parser(&data, opener),
                RelayShape::Map,
            ),
            Category::DataPostProcessors => run_relay(
                token,
                registry.data_post_processors.get(identifier).map(|handler| &**handler),
                || request::data_post_processor(&data, opener),
                RelayShape::Map,
            ),
            Category::SitePostProcessors => run_relay(
                token,
                registry.site_post_processors.get(identifier).map(|handler| &**handler),
                || request::site_post_processor(&data, opener),
                RelayShape::Sites,
            ),
            Category::Iterators => run_relay(
                token,
                registry.iterators.get(identifier).map(|handler| &**handler),
                || request::iterator(&data, opener),
                RelayShape::Strings,
            ),
        }
    }

    fn internal(&mut self, token: Token<'_>, identifier: &str, data: Vec<Value>) {
        match identifier {
            "config" => {
                let Some(config_function) = self.config_function.as_mut() else {
                    respond(token, &Value::from(MODULE_READY), &[]);
                    return;
                };
                let Some(config) = data.first().and_then(Value::as_map) else {
                    reject(token, Fault::InvalidInput, "config must be a map");
                    return;
                };
                match config_function(config) {
                    Ok(()) => {
                        info!(module = %self.name, "configured");
                        respond(token, &Value::from(MODULE_READY), &[]);
                    }
                    Err(text) => {
                        warn!(module = %self.name, reason = %text, "configuration rejected");
                        respond(token, &Value::Null, &[LogEntry::new(Severity::Fatal, text)]);
                    }
                }
            }
            "testMethods" => {
                let passed = run_fixtures(&self.registry);
                respond(token, &Value::Bool(passed), &[]);
            }
            other => {
                let command = format!("{INTERNAL_CATEGORY}_{other}");
                reject(token, Fault::InvalidCommand, &command);
            }
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("methods", &self.methods())
            .field("configurable", &self.config_function.is_some())
            .finish_non_exhaustive()
    }
}

/// Build the request, run the handler, and report its log. The handler is
/// never invoked for an unknown identifier or a rejected request.
fn run_relay<R>(
    token: Token<'_>,
    handler: Option<&(dyn Fn(R, &mut RelayResponse) + Send)>,
    build: impl FnOnce() -> std::result::Result<(R, RelayFile), LogEntry>,
    shape: RelayShape,
) {
    let Some(handler) = handler else {
        let command = token.command.clone();
        reject(token, Fault::InvalidCommand, &command);
        return;
    };
    let (request, relay) = match build() {
        Ok(built) => built,
        Err(entry) => {
            debug!(command = %token.command, reason = %entry.text, "request rejected");
            respond(token, &Value::Null, &[entry]);
            return;
        }
    };
    let mut response = RelayResponse::new(relay, shape);
    handler(request, &mut response);
    respond(token, &Value::Null, &response.finish());
}

fn reject(token: Token<'_>, fault: Fault, detail: &str) {
    debug!(command = %token.command, %fault, "rejecting call");
    respond(token, &Value::Null, &[LogEntry::fault(fault, Some(detail))]);
}

/// Send the response; if that fails, make one last attempt carrying only
/// the log plus an `InvalidResponse` entry.
fn respond(token: Token<'_>, data: &Value, log: &[LogEntry]) {
    let Err(unanswered) = token.respond(data, log) else {
        return;
    };
    warn!(error = %unanswered.error, "failed to send response; sending fallback");

    let mut fallback = log.to_vec();
    fallback.push(LogEntry::new(
        Severity::InvalidResponse,
        format!("failed to send data: {}", unanswered.error),
    ));
    if let Err(last) = unanswered.token.respond(&Value::Null, &fallback) {
        error!(error = %last.error, "failed to send fallback response");
    }
}
