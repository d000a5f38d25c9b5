use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use modlink_peer::{Methods, Value};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MethodsOutput<'a> {
    schema_id: &'a str,
    module: &'a str,
    methods: &'a Methods,
}

pub fn print_methods(module: &str, methods: &Methods, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&MethodsOutput {
            schema_id: "modlink/cli/v1/methods",
            module,
            methods,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CATEGORY", "IDENTIFIERS"]);
            for (category, identifiers) in methods {
                table.add_row(vec![category.clone(), identifiers.join(", ")]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (category, identifiers) in methods {
                println!("{category}: {}", identifiers.join(" "));
            }
        }
    }
}

#[derive(Serialize)]
struct ExecOutput<'a> {
    schema_id: &'a str,
    command: &'a str,
    result: serde_json::Value,
    relay: Option<serde_json::Value>,
}

pub fn print_exec(command: &str, result: &Value, relay: Option<&Value>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ExecOutput {
            schema_id: "modlink/cli/v1/exec",
            command,
            result: display_json(result),
            relay: relay.map(display_json),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COMMAND", "RESULT", "RELAY"])
                .add_row(vec![
                    command.to_string(),
                    display_json(result).to_string(),
                    relay.map(|value| display_json(value).to_string()).unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("command={command} result={}", display_json(result));
            if let Some(relay) = relay {
                println!("relay={}", display_json(relay));
            }
        }
    }
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    schema_id: &'a str,
    module: &'a str,
    config: &'a str,
    self_test: bool,
}

pub fn print_check(module: &str, config: &str, self_test: bool, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&CheckOutput {
            schema_id: "modlink/cli/v1/check",
            module,
            config,
            self_test,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MODULE", "CONFIG", "SELF-TEST"])
                .add_row(vec![
                    module.to_string(),
                    config.to_string(),
                    if self_test { "pass" } else { "FAIL" }.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "module={module} config={config:?} self_test={}",
                if self_test { "pass" } else { "fail" }
            );
        }
    }
}

/// JSON rendering for humans: UTF-8 bytes print as text.
pub fn display_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => serde_json::Value::String(text.to_string()),
            Err(_) => value.to_json(),
        },
        other => other.to_json(),
    }
}

fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
