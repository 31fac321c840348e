use std::io::Write;

use clap::Parser;
use cryptoki_mgmt_hsm::{CK_SLOT_ID, SessionFlags, SessionHandle, Token};

use crate::{error::result::CliResult, output::write_random};

/// Draw random bytes from the token generator
#[derive(Parser, Debug)]
pub struct RandomAction {
    /// Slot holding the token
    #[arg(long, short, default_value_t = 2)]
    pub slot: CK_SLOT_ID,

    /// Number of random bytes
    #[arg(long, short, default_value_t = 20)]
    pub length: usize,

    /// Hex-encoded seed mixed into the generator first
    #[arg(long)]
    pub seed: Option<String>,
}

impl RandomAction {
    /// Open a read-write session, optionally seed, generate, print and close
    /// the session, even when generation failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is not hex, a token call fails or `out`
    /// cannot be written.
    pub fn process(&self, token: &Token, out: &mut impl Write) -> CliResult<()> {
        let seed = self.seed.as_deref().map(hex::decode).transpose()?;
        let session = token.open_session(
            self.slot,
            SessionFlags::RW_SESSION | SessionFlags::SERIAL_SESSION,
        )?;
        let result = self.generate(token, session, seed.as_deref(), out);
        let closed = token.close_session(session);
        result?;
        Ok(closed?)
    }

    fn generate(
        &self,
        token: &Token,
        session: SessionHandle,
        seed: Option<&[u8]>,
        out: &mut impl Write,
    ) -> CliResult<()> {
        if let Some(seed) = seed {
            token.seed_random(session, seed)?;
        }
        let random = token.generate_random(session, self.length)?;
        write_random(out, &random)?;
        Ok(())
    }
}
