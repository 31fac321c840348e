use std::io::Write;

use clap::{ArgGroup, Parser};
use cryptoki_mgmt_hsm::{CK_SLOT_ID, Token};
use tracing::debug;

use crate::{
    error::result::CliResult,
    output::{write_general_info, write_slot_info, write_token_info},
};

/// Display the module, slot and token information.
///
/// At least one of `--info`, `--slot` and `--token` must be given.
/// The legacy single-dash spellings (`-info`, `-slot`, `-token`) are accepted.
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
#[clap(group(
    ArgGroup::new("what")
        .required(true)
        .multiple(true)
        .args(["info", "slot", "token"])
))]
pub struct InfoAction {
    /// Get the general information
    #[arg(long)]
    pub info: bool,

    /// Get the slot information of the specified slot
    #[arg(long)]
    pub slot: bool,

    /// Get the token information of the token in the specified slot
    #[arg(long)]
    pub token: bool,

    /// Slot id of the slot or token information to retrieve,
    /// default: all slots holding a token
    pub slot_id: Option<CK_SLOT_ID>,
}

impl InfoAction {
    /// Query the module and write the selected blocks to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or `out` cannot be written.
    pub fn process(&self, token: &Token, out: &mut impl Write) -> CliResult<()> {
        if self.info {
            write_general_info(out, &token.general_info()?)?;
        }
        if !self.slot && !self.token {
            return Ok(());
        }
        let slot_ids = match self.slot_id {
            Some(slot_id) => vec![slot_id],
            None => token.slot_list(true)?,
        };
        debug!("describing slots {slot_ids:?}");
        for slot_id in slot_ids {
            if self.slot {
                write_slot_info(out, &token.slot_info(slot_id)?)?;
            }
            if self.token {
                write_token_info(out, &token.token_info(slot_id)?)?;
            }
        }
        Ok(())
    }
}
