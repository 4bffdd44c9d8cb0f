pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ArgGroup, ColorChoice, Command,
};

fn inspect() -> Command {
    Command::new("inspect")
        .about("Show the identity and lifecycle state of a certificate chain")
        .arg(
            Arg::new("chain")
                .short('c')
                .long("chain")
                .help("PEM file with the chain, leaf first")
                .value_parser(clap::value_parser!(std::path::PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("ca")
                .long("ca")
                .help("CA certificate to verify the chain against")
                .env("MILLEGRILLES_AUTH_CA")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            Arg::new("now")
                .long("now")
                .help("Evaluate at this unix time instead of the current time")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn code() -> Command {
    Command::new("code")
        .about("Print the activation code of a public key or CSR")
        .arg(
            Arg::new("public-key")
                .short('k')
                .long("public-key")
                .help("Hex encoded Ed25519 public key"),
        )
        .arg(
            Arg::new("csr")
                .long("csr")
                .help("PEM certificate signing request")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .group(
            ArgGroup::new("source")
                .args(["public-key", "csr"])
                .required(true),
        )
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("millegrilles-auth")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(inspect())
        .subcommand(code());

    logging::with_args(command)
}
