use crate::keygen::inspect_csr;
use crate::recovery::activation_code;
use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug)]
pub enum Args {
    PublicKey(String),
    Csr(PathBuf),
}

/// # Errors
/// Returns an error if the key is not hex or the CSR cannot be read.
pub fn code(args: &Args) -> Result<String> {
    let public_key_hex = match args {
        Args::PublicKey(hex) => hex.clone(),
        Args::Csr(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read CSR at {}", path.display()))?;
            inspect_csr(&pem).context("invalid CSR")?.public_key_hex
        }
    };
    activation_code(&public_key_hex).context("cannot derive activation code")
}

/// Execute the code action.
/// # Errors
/// Returns an error if no code can be derived.
pub fn execute(args: &Args) -> Result<()> {
    println!("{}", code(args)?);
    Ok(())
}
