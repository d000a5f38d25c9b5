use std::path::Path;

use crate::cmd::{MethodsArgs, Session};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_methods, OutputFormat};

pub fn run(args: MethodsArgs, format: OutputFormat, types: Option<&Path>) -> CliResult<i32> {
    let session = Session::open(&args.module, &args.module_args, types)?;
    let name = session.name().to_string();
    let outcome = session.call("getMethods", |host| host.ask_methods());
    let methods = session.finish(outcome)?;
    print_methods(&name, &methods, format);
    Ok(SUCCESS)
}
