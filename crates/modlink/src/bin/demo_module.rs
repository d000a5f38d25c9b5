//! A small module binary that exercises every capability category.
//!
//! Run it under `modlink exec` or spawn it from a `ModuleHost`. Stdout is the
//! protocol channel; logs go to stderr.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use clap::Parser;
use modlink::logging::{init_logging, LogFormat, LogLevel};
use modlink::module::{Fixture, Module, Response};
use modlink::Value;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "modlink-demo-module", version, about = "Demo modlink module")]
struct Args {
    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: LogLevel,
}

type SharedRoot = Arc<RwLock<Option<PathBuf>>>;

fn resolve(root: &SharedRoot, variable: &str) -> PathBuf {
    match root.read() {
        Ok(guard) => match guard.as_ref() {
            Some(root) => root.join(variable),
            None => PathBuf::from(variable),
        },
        Err(_) => PathBuf::from(variable),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_format, args.log_level);

    let root: SharedRoot = Arc::new(RwLock::new(None));
    let mut module = Module::abort_on_error(Module::new("demo"));

    let config_root = Arc::clone(&root);
    Module::abort_on_error(module.register_config_function(move |config| {
        for (key, value) in config {
            match (key.as_str(), value) {
                ("root", Value::String(path)) => {
                    let mut guard = config_root
                        .write()
                        .map_err(|_| "root lock poisoned".to_string())?;
                    *guard = Some(PathBuf::from(path));
                    info!(root = %path, "configured content root");
                }
                ("root", other) => {
                    return Err(format!("root must be a string, got {}", other.kind()))
                }
                (other, _) => return Err(format!("unknown config key: {other}")),
            }
        }
        Ok(())
    }));

    let loader_root = Arc::clone(&root);
    Module::abort_on_error(module.register_data_loader("file", move |request, response| {
        let path = resolve(&loader_root, &request.variable);
        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!(path = %path.display(), len = bytes.len(), "loaded");
                response.add_data(Value::bytes(bytes));
            }
            Err(err) => response.add_fatal(&format!("cannot read {}: {err}", path.display())),
        }
    }));

    Module::abort_on_error(module.register_data_parser("json", |request, response| {
        match serde_json::from_slice::<serde_json::Value>(&request.data) {
            Ok(json @ serde_json::Value::Object(_)) => {
                response.add_data(Value::from_json(json));
            }
            Ok(_) => response.add_fatal("json document is not an object"),
            Err(err) => response.add_fatal(&format!("invalid json: {err}")),
        }
    }));

    Module::abort_on_error(
        module.register_data_post_processor("identity", |request, response| {
            response.add_data(Value::Map(request.data));
        }),
    );

    Module::abort_on_error(
        module.register_site_post_processor("noop", |request, response| {
            response.add_debug(&format!("saw {} sites", request.sites.len()));
        }),
    );

    let iterator_root = Arc::clone(&root);
    Module::abort_on_error(module.register_iterator("ls", move |request, response| {
        let dir = resolve(&iterator_root, &request.variable);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                response.add_fatal(&format!("cannot list {}: {err}", dir.display()));
                return;
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        response.add_data(Value::List(names.into_iter().map(Value::from).collect()));
    }));

    Module::abort_on_error(module.register_template_function(
        "noescape",
        |request, response| match request.data.first().and_then(Value::as_str) {
            Some(text) => {
                response.add_data(Value::typed("html", Value::from(text)));
            }
            None => response.add_fatal("noescape takes one string"),
        },
        Fixture::new(
            vec![Value::from("<b>x</b>")],
            Value::typed("html", Value::from("<b>x</b>")),
        ),
    ));

    Module::abort_on_error(module.register_template_function(
        "add",
        |request, response| {
            let mut sum: i64 = 0;
            for value in &request.data {
                match value.as_int() {
                    Some(n) => sum = sum.saturating_add(n),
                    None => {
                        response.add_fatal(&format!("add takes integers, got {}", value.kind()));
                        return;
                    }
                }
            }
            response.add_data(Value::Int(sum));
        },
        Fixture::new(vec![Value::Int(2), Value::Int(3)], Value::Int(5)),
    ));

    debug!(methods = ?module.methods(), "registered");
    module.start();
}
