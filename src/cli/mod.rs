//! Command-line interface for pqshare.
//!
//! Commands operate on a RocksDB store under `$PQSHARE_DATA_DIR`. Passphrases
//! are read from the terminal without echo.

pub mod args;
pub mod commands;
pub mod utils;

use crate::Result;

pub use args::Command;

/// Main entry point for the CLI application
pub fn run() -> Result<()> {
    let command = args::parse_args()?;
    if command == Command::Help {
        args::print_usage();
        return Ok(());
    }

    let session = utils::open_session()?;

    match command {
        Command::Keygen { uid } => commands::keygen(&session, &uid),
        Command::Put { uid, file, parent } => commands::put(&session, &uid, &file, parent),
        Command::Mkdir { uid, name, parent } => commands::mkdir(&session, &uid, &name, parent),
        Command::Ls { uid } => commands::ls(&session, &uid),
        Command::Cat {
            uid,
            entity,
            output,
        } => commands::cat(&session, &uid, &entity, output.as_deref()),
        Command::Share {
            uid,
            entity,
            recipient,
        } => commands::share(&session, &uid, &entity, &recipient),
        Command::Revoke {
            uid,
            entity,
            recipient,
        } => commands::revoke(&session, &uid, &entity, &recipient),
        Command::Rm { uid, entity } => commands::rm(&session, &uid, &entity),
        Command::RotateKey { uid, entity } => commands::rotate_key(&session, &uid, &entity),
        Command::Migrate { uid } => commands::migrate(&session, &uid),
        Command::RemoveContact { uid, contact } => {
            commands::remove_contact(&session, &uid, &contact)
        }
        Command::Help => Ok(()),
    }
}
