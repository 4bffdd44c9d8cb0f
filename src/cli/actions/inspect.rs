use crate::certificate::{split_pem_chain, CertificateStore, CertificateWrapper};
use crate::lifecycle::{classify, now_unix_seconds, CertificateState};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub chain: PathBuf,
    pub ca: Option<PathBuf>,
    pub now: Option<i64>,
}

#[derive(Debug)]
pub struct Report {
    pub common_name: Option<String>,
    pub user_id: Option<String>,
    pub public_key_hex: String,
    pub fingerprint: String,
    pub not_before: i64,
    pub not_after: i64,
    pub state: CertificateState,
    /// `None` when no CA was given.
    pub trusted: Option<bool>,
}

/// # Errors
/// Returns an error if a file cannot be read or holds no certificate.
pub fn report(args: &Args) -> Result<Report> {
    let text = std::fs::read_to_string(&args.chain)
        .with_context(|| format!("Failed to read chain at {}", args.chain.display()))?;
    let mut chain = split_pem_chain(&text)
        .with_context(|| format!("Failed to parse chain at {}", args.chain.display()))?;
    if chain.is_empty() {
        bail!("no certificate found in {}", args.chain.display());
    }

    let store = match &args.ca {
        Some(path) => {
            let ca = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read CA at {}", path.display()))?;
            Some(CertificateStore::new(&ca).context("invalid CA certificate")?)
        }
        None => None,
    };
    if let Some(store) = &store {
        chain.retain(|pem| !store.is_ca(pem));
    }

    let wrapper = CertificateWrapper::parse(&chain).context("invalid certificate chain")?;
    let now = args.now.unwrap_or_else(now_unix_seconds);
    let trusted = store.map(|store| match store.verify_chain(&wrapper, now) {
        Ok(()) => true,
        Err(err) => {
            debug!("chain not trusted: {err}");
            false
        }
    });

    Ok(Report {
        common_name: wrapper.common_name().map(str::to_string),
        user_id: wrapper.user_id().map(str::to_string),
        public_key_hex: wrapper.public_key_hex(),
        fingerprint: wrapper.fingerprint(),
        not_before: wrapper.not_before(),
        not_after: wrapper.not_after(),
        state: classify(wrapper.not_before(), wrapper.not_after(), now),
        trusted,
    })
}

fn timestamp(seconds: i64) -> String {
    OffsetDateTime::from_unix_timestamp(seconds)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| seconds.to_string())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "common name: {}", self.common_name.as_deref().unwrap_or("-"))?;
        writeln!(f, "user id:     {}", self.user_id.as_deref().unwrap_or("-"))?;
        writeln!(f, "public key:  {}", self.public_key_hex)?;
        writeln!(f, "fingerprint: {}", self.fingerprint)?;
        writeln!(f, "not before:  {}", timestamp(self.not_before))?;
        writeln!(f, "not after:   {}", timestamp(self.not_after))?;
        let state = match self.state {
            CertificateState::Valid => "valid",
            CertificateState::RenewalDue => "renewal due",
            CertificateState::Expired => "expired",
        };
        write!(f, "state:       {state}")?;
        if let Some(trusted) = self.trusted {
            write!(f, "\ntrusted:     {}", if trusted { "yes" } else { "no" })?;
        }
        Ok(())
    }
}

/// Execute the inspect action.
/// # Errors
/// Returns an error if the chain cannot be read or parsed.
pub fn execute(args: &Args) -> Result<()> {
    let report = report(args)?;
    println!("{report}");
    Ok(())
}
