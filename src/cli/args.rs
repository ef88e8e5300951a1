//! Command-line argument parsing for pqshare.

use crate::error::{Result, ShareError};
use crate::types::{EntityId, UserId};
use std::env;
use std::path::PathBuf;

/// Command-line interface commands
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Keygen {
        uid: UserId,
    },
    Put {
        uid: UserId,
        file: PathBuf,
        parent: Option<EntityId>,
    },
    Mkdir {
        uid: UserId,
        name: String,
        parent: Option<EntityId>,
    },
    Ls {
        uid: UserId,
    },
    Cat {
        uid: UserId,
        entity: EntityId,
        output: Option<PathBuf>,
    },
    Share {
        uid: UserId,
        entity: EntityId,
        recipient: UserId,
    },
    Revoke {
        uid: UserId,
        entity: EntityId,
        recipient: UserId,
    },
    Rm {
        uid: UserId,
        entity: EntityId,
    },
    RotateKey {
        uid: UserId,
        entity: EntityId,
    },
    Migrate {
        uid: UserId,
    },
    RemoveContact {
        uid: UserId,
        contact: UserId,
    },
    Help,
}

/// Parse the process arguments into a Command
pub fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_from(&args)
}

fn usage_error(usage: &str) -> ShareError {
    ShareError::validation(format!("usage: pqshare {}", usage))
}

/// Splits `--parent <id>` out of the positional arguments
fn take_parent(args: &[String]) -> Result<(Vec<&String>, Option<EntityId>)> {
    let mut positional = Vec::new();
    let mut parent = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--parent" {
            let value = iter
                .next()
                .ok_or_else(|| ShareError::validation("--parent requires an entity id"))?;
            parent = Some(EntityId::new(value.as_str())?);
        } else {
            positional.push(arg);
        }
    }
    Ok((positional, parent))
}

fn positional<'a>(rest: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .ok_or_else(|| usage_error(usage))
}

/// Parse arguments (without the program name) into a Command
pub fn parse_from(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };

    let arg = |i: usize, usage: &str| positional(rest, i, usage);

    match command.as_str() {
        "keygen" => Ok(Command::Keygen {
            uid: arg(0, "keygen <uid>")?.parse()?,
        }),

        "put" => {
            let (positional, parent) = take_parent(rest)?;
            let [uid, file] = positional.as_slice() else {
                return Err(usage_error("put <uid> <file> [--parent <id>]"));
            };
            Ok(Command::Put {
                uid: uid.parse()?,
                file: PathBuf::from(file.as_str()),
                parent,
            })
        }

        "mkdir" => {
            let (positional, parent) = take_parent(rest)?;
            let [uid, name] = positional.as_slice() else {
                return Err(usage_error("mkdir <uid> <name> [--parent <id>]"));
            };
            Ok(Command::Mkdir {
                uid: uid.parse()?,
                name: name.to_string(),
                parent,
            })
        }

        "ls" => Ok(Command::Ls {
            uid: arg(0, "ls <uid>")?.parse()?,
        }),

        "cat" => {
            let usage = "cat <uid> <entity> [output]";
            Ok(Command::Cat {
                uid: arg(0, usage)?.parse()?,
                entity: arg(1, usage)?.parse()?,
                output: rest.get(2).map(PathBuf::from),
            })
        }

        "share" => {
            let usage = "share <uid> <entity> <recipient>";
            Ok(Command::Share {
                uid: arg(0, usage)?.parse()?,
                entity: arg(1, usage)?.parse()?,
                recipient: arg(2, usage)?.parse()?,
            })
        }

        "revoke" => {
            let usage = "revoke <uid> <entity> <recipient>";
            Ok(Command::Revoke {
                uid: arg(0, usage)?.parse()?,
                entity: arg(1, usage)?.parse()?,
                recipient: arg(2, usage)?.parse()?,
            })
        }

        "rm" => {
            let usage = "rm <uid> <entity>";
            Ok(Command::Rm {
                uid: arg(0, usage)?.parse()?,
                entity: arg(1, usage)?.parse()?,
            })
        }

        "rotate-key" => {
            let usage = "rotate-key <uid> <entity>";
            Ok(Command::RotateKey {
                uid: arg(0, usage)?.parse()?,
                entity: arg(1, usage)?.parse()?,
            })
        }

        "migrate" => Ok(Command::Migrate {
            uid: arg(0, "migrate <uid>")?.parse()?,
        }),

        "remove-contact" => {
            let usage = "remove-contact <uid> <contact>";
            Ok(Command::RemoveContact {
                uid: arg(0, usage)?.parse()?,
                contact: arg(1, usage)?.parse()?,
            })
        }

        "help" | "--help" | "-h" => Ok(Command::Help),

        other => Err(ShareError::validation(format!("unknown command '{}'", other))),
    }
}

/// Print usage information
pub fn print_usage() {
    println!("pqshare - post-quantum file sharing");
    println!("===================================");
    println!();
    println!("Usage: pqshare <command> [args...]");
    println!();
    println!("Commands:");
    println!("  keygen <uid>                              Generate and publish a key pair");
    println!("  put <uid> <file> [--parent <id>]          Encrypt and store a file");
    println!("  mkdir <uid> <name> [--parent <id>]        Create a folder");
    println!("  ls <uid>                                  List entities the user can open");
    println!("  cat <uid> <entity> [output]               Decrypt an entity's content");
    println!("  share <uid> <entity> <recipient>          Grant a recipient access");
    println!("  revoke <uid> <entity> <recipient>         Revoke a recipient's access");
    println!("  rm <uid> <entity>                         Delete an owned entity");
    println!("  rotate-key <uid> <entity>                 Re-encrypt under a new content key");
    println!("  migrate <uid>                             Move all wrapped keys to a new key pair");
    println!("  remove-contact <uid> <contact>            Revoke a contact from every owned entity");
    println!();
    println!("Environment:");
    println!("  PQSHARE_DATA_DIR    Store location (default ~/.pqshare)");
    println!("  RUST_LOG            Log filter (default pqshare=info)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_from(&owned)
    }

    #[test]
    fn test_parse_put_with_parent() {
        let command = parse(&["put", "alice", "notes.txt", "--parent", "dir-1"]).unwrap();
        assert_eq!(
            command,
            Command::Put {
                uid: UserId::new("alice").unwrap(),
                file: PathBuf::from("notes.txt"),
                parent: Some(EntityId::new("dir-1").unwrap()),
            }
        );
    }

    #[test]
    fn test_parse_share() {
        let command = parse(&["share", "alice", "doc-1", "bob"]).unwrap();
        assert!(matches!(command, Command::Share { .. }));
    }

    #[test]
    fn test_missing_arguments_are_errors() {
        assert!(matches!(parse(&["share", "alice"]), Err(ShareError::Validation(_))));
        assert!(parse(&["put", "alice", "--parent"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn test_invalid_uid_is_rejected() {
        assert!(parse(&["ls", "bad:uid"]).is_err());
    }

    #[test]
    fn test_no_arguments_is_help() {
        assert_eq!(parse(&[]).unwrap(), Command::Help);
    }
}
