use crate::cli::actions::{code, inspect, Action};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("inspect", sub)) => Ok(Action::Inspect(inspect::Args {
            chain: sub
                .get_one::<PathBuf>("chain")
                .cloned()
                .context("missing required argument: --chain")?,
            ca: sub.get_one::<PathBuf>("ca").cloned(),
            now: sub.get_one::<i64>("now").copied(),
        })),
        Some(("code", sub)) => {
            if let Some(key) = sub.get_one::<String>("public-key") {
                Ok(Action::Code(code::Args::PublicKey(key.clone())))
            } else {
                let csr = sub
                    .get_one::<PathBuf>("csr")
                    .cloned()
                    .context("missing argument: --public-key or --csr")?;
                Ok(Action::Code(code::Args::Csr(csr)))
            }
        }
        Some((name, _)) => bail!("unknown command: {name}"),
        None => bail!("missing command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn dispatch_code_from_public_key() {
        let matches = commands::new().get_matches_from(vec![
            "millegrilles-auth",
            "code",
            "--public-key",
            "00a1b2c3d4",
        ]);
        match handler(&matches).unwrap() {
            Action::Code(code::Args::PublicKey(key)) => assert_eq!(key, "00a1b2c3d4"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn dispatch_inspect() {
        let matches = commands::new().get_matches_from(vec![
            "millegrilles-auth",
            "inspect",
            "--chain",
            "chain.pem",
        ]);
        let Action::Inspect(args) = handler(&matches).unwrap() else {
            panic!("expected inspect");
        };
        assert_eq!(args.chain, PathBuf::from("chain.pem"));
        assert!(args.now.is_none());
    }
}
