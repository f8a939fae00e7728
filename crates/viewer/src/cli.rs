use std::path::PathBuf;

use anyhow::Context;

#[derive(Debug, Default)]
pub(crate) struct Args {
    pub config_path: Option<PathBuf>,
    pub relay_url: Option<String>,
    pub saved_hosts_path: Option<String>,
    pub recordings_dir: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    parse_args_from(std::env::args().skip(1))
}

fn print_help() {
    println!("relaydesk-viewer - Relaydesk remote desktop viewer");
    println!();
    println!("USAGE:");
    println!("    relaydesk-viewer [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              Config file [default: <config dir>/relaydesk/viewer.toml]");
    println!("    --relay-url <URL>            Relay WebSocket URL (overrides relay.url)");
    println!("    --saved-hosts <PATH>         Saved hosts file (overrides storage.saved_hosts_path)");
    println!("    --recordings-dir <DIR>       Local recording output directory");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args_from(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" | "--version" => {
                println!("relaydesk-viewer {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" => {
                parsed.config_path = Some(args.next().context("Missing --config value")?.into());
            }
            "--relay-url" => {
                parsed.relay_url = Some(args.next().context("Missing --relay-url value")?);
            }
            "--saved-hosts" => {
                parsed.saved_hosts_path = Some(args.next().context("Missing --saved-hosts value")?);
            }
            "--recordings-dir" => {
                parsed.recordings_dir =
                    Some(args.next().context("Missing --recordings-dir value")?);
            }
            other => anyhow::bail!("Unknown argument: {other} (see --help)"),
        }
    }
    Ok(parsed)
}
