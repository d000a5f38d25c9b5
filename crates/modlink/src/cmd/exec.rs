use std::path::Path;

use modlink_peer::{split_command, Category, PayloadCodec, RelayFile, Value};
use tracing::{debug, warn};

use crate::cmd::{parse_json, ExecArgs, Session};
use crate::exit::{io_error, relay_error, CliResult, SUCCESS};
use crate::output::{print_exec, OutputFormat};

/// Initial relay content requested on the command line.
enum Seed {
    Value(Value),
    Raw(Vec<u8>),
    Empty,
}

pub fn run(args: ExecArgs, format: OutputFormat, types: Option<&Path>) -> CliResult<i32> {
    let mut call_args = args
        .args
        .iter()
        .map(|arg| parse_json("--arg", arg))
        .collect::<CliResult<Vec<_>>>()?;
    let seed = resolve_seed(&args)?;

    let session = Session::open(&args.module, &args.module_args, types)?;
    let mut relay = match seed {
        Some(seed) => Some(create_relay(session.codec(), seed)?),
        None => None,
    };
    if let Some(relay) = &relay {
        debug!(reference = %relay.reference(), "passing relay file");
        call_args.insert(0, Value::from(relay.reference()));
    }

    let command = args.command.clone();
    let result = session.call(&args.command, move |host| {
        host.execute_method(&command, call_args)
    });

    let relay_value = match relay.as_mut() {
        Some(relay) if result.is_ok() => relay.retrieve().map(Some),
        _ => Ok(None),
    };
    if let Some(mut relay) = relay {
        if let Err(err) = relay.cleanup() {
            warn!(error = %err, "failed to remove relay file");
        }
    }
    let outcome = result.and_then(|result| {
        let relay_value =
            relay_value.map_err(|err| relay_error("failed reading relay file", err))?;
        Ok((result, relay_value))
    });
    let (result, relay_value) = session.finish(outcome)?;

    print_exec(&args.command, &result, relay_value.as_ref(), format);
    Ok(SUCCESS)
}

/// Relay categories get a relay file even without an explicit seed.
fn resolve_seed(args: &ExecArgs) -> CliResult<Option<Seed>> {
    if let Some(json) = &args.relay {
        return Ok(Some(Seed::Value(parse_json("--relay", json)?)));
    }
    if let Some(path) = &args.relay_file {
        let bytes = std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        return Ok(Some(Seed::Raw(bytes)));
    }
    let uses_relay = split_command(&args.command)
        .and_then(|(category, _)| Category::from_key(category))
        .is_some_and(|category| category != Category::TemplateFunctions);
    Ok(uses_relay.then_some(Seed::Empty))
}

fn create_relay(codec: PayloadCodec, seed: Seed) -> CliResult<RelayFile> {
    let relay = match seed {
        Seed::Value(value) => RelayFile::create(codec, Some(&value)),
        Seed::Raw(bytes) => RelayFile::create_raw(codec, &bytes),
        Seed::Empty => RelayFile::create(codec, None),
    };
    relay.map_err(|err| relay_error("failed creating relay file", err))
}
