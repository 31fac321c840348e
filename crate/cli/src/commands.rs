use std::{
    ffi::{OsStr, OsString},
    io::Write,
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use cryptoki_mgmt_hsm::Token;
use cryptoki_mgmt_logger::log_init;
use tracing::{info, trace};

use crate::{
    actions::{info::InfoAction, random::RandomAction},
    config::{CRYPTOKI_LIBRARY_ENV, CRYPTOKI_MGMT_CONF_ENV, CliConf},
    error::result::CliResult,
};

#[derive(Parser, Debug)]
#[command(name = "ckmgmt", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file location
    ///
    /// This is an alternative to the env variable `CRYPTOKI_MGMT_CONF`.
    /// Defaults to `cryptoki.toml` in the working directory.
    #[arg(short, long, env = CRYPTOKI_MGMT_CONF_ENV, global = true)]
    pub conf: Option<PathBuf>,

    /// Location of the PKCS#11 library, overriding the configuration file
    #[arg(long, env = CRYPTOKI_LIBRARY_ENV, global = true)]
    pub library: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub enum CliCommands {
    Info(InfoAction),
    Random(RandomAction),
}

const LEGACY_INFO_FLAGS: [&str; 3] = ["info", "slot", "token"];
const SUBCOMMANDS: [&str; 3] = ["info", "random", "help"];
/// Global options followed by a separate value.
const VALUED_OPTIONS: [&str; 3] = ["-c", "--conf", "--library"];

fn legacy_flag(arg: &OsStr) -> Option<&'static str> {
    let arg = arg.to_str()?;
    let name = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))?;
    LEGACY_INFO_FLAGS
        .into_iter()
        .find(|flag| flag.eq_ignore_ascii_case(name))
}

fn has_subcommand(args: &[OsString]) -> bool {
    let mut option_value = false;
    for arg in args.iter().skip(1) {
        if std::mem::take(&mut option_value) {
            continue;
        }
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if VALUED_OPTIONS.contains(&arg) {
            option_value = true;
        } else if SUBCOMMANDS.contains(&arg) {
            return true;
        }
    }
    false
}

/// Rewrite the historical command line into the subcommand form.
///
/// `-info`, `-slot` and `-token` are matched case-insensitively with one or
/// two dashes and become `--info`, `--slot` and `--token`. They may appear
/// anywhere: when one is given and no subcommand is, the `info` subcommand is
/// inserted after the program name.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut legacy = false;
    let mut args: Vec<OsString> = args
        .into_iter()
        .map(Into::into)
        .map(|arg| match legacy_flag(&arg) {
            Some(flag) => {
                legacy = true;
                OsString::from(format!("--{flag}"))
            }
            None => arg,
        })
        .collect();
    if legacy && !args.is_empty() && !has_subcommand(&args) {
        args.insert(1, OsString::from("info"));
    }
    args
}

/// Main function of the `ckmgmt` binary.
///
/// Parses `args` (program name first), resolves the library from the
/// arguments or the configuration file, loads the module, runs the command
/// writing its report to `out`, and finalizes the module.
///
/// # Errors
///
/// - `CliError::Clap` for invalid arguments, `--help` and `--version`
/// - `CliError::Configuration` when the library location cannot be resolved
/// - `CliError::Hsm` when loading the module or a token call fails
pub fn ckmgmt_main<I, T>(args: I, out: &mut impl Write) -> CliResult<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    log_init("warn");
    let cli = Cli::try_parse_from(normalize_args(args))?;
    trace!("command line: {cli:?}");

    let library = CliConf::library_location(cli.conf, cli.library)?;
    let token = Token::load(&library)?;
    info!("running {:?}", cli.command);

    match &cli.command {
        CliCommands::Info(action) => action.process(&token, out)?,
        CliCommands::Random(action) => action.process(&token, out)?,
    }
    out.flush()?;
    token.finalize()?;
    Ok(())
}
