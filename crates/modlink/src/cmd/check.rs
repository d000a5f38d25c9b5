use std::path::Path;

use modlink_peer::{Value, INTERNAL_CONFIG, INTERNAL_TEST_METHODS, MODULE_READY};
use tracing::warn;

use crate::cmd::{parse_json, CheckArgs, Session};
use crate::exit::{
    CliError, CliResult, DATA_INVALID, FAILURE, HEALTH_CHECK_FAILED, SUCCESS, USAGE,
};
use crate::output::{print_check, OutputFormat};

pub fn run(args: CheckArgs, format: OutputFormat, types: Option<&Path>) -> CliResult<i32> {
    let config = parse_json("--config", &args.config)?;
    if config.as_map().is_none() {
        return Err(CliError::new(USAGE, "--config must be a JSON object"));
    }

    let session = Session::open(&args.module, &args.module_args, types)?;
    // A rejected configuration fails the check like a failed self-test.
    let outcome = configure_and_test(&session, config).map_err(|err| match err.code {
        FAILURE => CliError::new(HEALTH_CHECK_FAILED, err.message),
        _ => err,
    });
    let (ready, self_test) = session.finish(outcome)?;

    print_check(&args.module.module.to_string_lossy(), &ready, self_test, format);
    if self_test {
        Ok(SUCCESS)
    } else {
        warn!("module self-test failed");
        Ok(HEALTH_CHECK_FAILED)
    }
}

fn configure_and_test(session: &Session, config: Value) -> CliResult<(String, bool)> {
    let ready = session.call(INTERNAL_CONFIG, move |host| {
        host.execute_method(INTERNAL_CONFIG, vec![config])
    })?;
    let ready = match ready {
        Value::String(text) => text,
        other => {
            return Err(CliError::new(
                DATA_INVALID,
                format!("{INTERNAL_CONFIG} answered {} instead of {MODULE_READY:?}", other.kind()),
            ))
        }
    };

    let passed = session.call(INTERNAL_TEST_METHODS, |host| {
        host.execute_method(INTERNAL_TEST_METHODS, Vec::new())
    })?;
    match passed {
        Value::Bool(passed) => Ok((ready, passed)),
        other => Err(CliError::new(
            DATA_INVALID,
            format!("{INTERNAL_TEST_METHODS} answered {} instead of a bool", other.kind()),
        )),
    }
}
