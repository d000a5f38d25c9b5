use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("modlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: modlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol_version: {}", modlink_peer::PROTOCOL_VERSION);
    println!(
        "target: {}",
        option_env!("MODLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: module={}, async={}, cli=true",
        cfg!(feature = "module"),
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
