use std::{env, io, process};

use cryptoki_mgmt_cli::{ckmgmt_main, error::CliError};

fn main() {
    let mut stdout = io::stdout().lock();
    match ckmgmt_main(env::args_os(), &mut stdout) {
        Ok(()) => {}
        // usage on stderr and a non-zero exit, or help/version on stdout
        Err(CliError::Clap(e)) => e.exit(),
        Err(err) => {
            eprintln!("ERROR: {err}");
            process::exit(1);
        }
    }
}
