use cryptoki_mgmt_hsm::HError;
use thiserror::Error;

pub mod result;

#[derive(Error, Debug)]
pub enum CliError {
    /// Bad arguments, `--help` and `--version`: clap renders and exits.
    #[error(transparent)]
    Clap(#[from] clap::Error),
    #[error("{0}")]
    Configuration(String),
    #[error(transparent)]
    FromHexError(#[from] hex::FromHexError),
    #[error(transparent)]
    Hsm(#[from] HError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
