use ballotledger::Config;
use clap::{App, Arg, SubCommand};
use log::LevelFilter;

mod command_chain;
mod command_e2e;
mod command_init;
mod command_keygen;
mod command_sign;

use command_chain::*;
use command_e2e::*;
use command_init::*;
use command_keygen::*;
use command_sign::*;

fn main() {
    let matches = App::new("BallotLedger CLI")
        .version("0.1")
        .about("Operator tooling for the ballotledger integrity core")
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate a new KEK and an ed25519 signing key pair (printed, not stored)"),
        )
        .subcommand(SubCommand::with_name("init-keys").about(
            "Create (or check) the wrapped data key and the signing key configured in the environment",
        ))
        .subcommand(
            SubCommand::with_name("verify-chain")
                .about("Verify an exported hash chain")
                .arg(
                    Arg::with_name("INPUT")
                        .index(1)
                        .required(true)
                        .help("JSON array of chain links, in ascending id order"),
                ),
        )
        .subcommand(
            SubCommand::with_name("sign")
                .about("Sign a results bundle with the configured signing key")
                .arg(
                    Arg::with_name("INPUT")
                        .index(1)
                        .required(true)
                        .help("Results bundle in JSON format"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Verify a signed results bundle")
                .arg(
                    Arg::with_name("INPUT")
                        .index(1)
                        .required(true)
                        .help("Signed bundle in JSON format"),
                )
                .arg(
                    Arg::with_name("public-key")
                        .long("public-key")
                        .takes_value(true)
                        .help("Trusted public key in hex. Defaults to the key embedded in the bundle"),
                ),
        )
        .subcommand(
            SubCommand::with_name("e2e")
                .about("Run a throwaway election end to end against an in-memory store")
                .arg(
                    Arg::with_name("voters")
                        .long("voters")
                        .takes_value(true)
                        .default_value("5")
                        .help("Number of ballots to cast"),
                )
                .arg(
                    Arg::with_name("print-chain")
                        .long("print-chain")
                        .help("Print the resulting chain links as JSON"),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    // Subcommands
    if let Some(matches) = matches.subcommand_matches("keygen") {
        command_keygen(matches);
        std::process::exit(0);
    }

    if let Some(matches) = matches.subcommand_matches("init-keys") {
        command_init_keys(matches, &load_config());
        std::process::exit(0);
    }

    if let Some(matches) = matches.subcommand_matches("verify-chain") {
        command_verify_chain(matches);
        std::process::exit(0);
    }

    if let Some(matches) = matches.subcommand_matches("sign") {
        command_sign(matches, &load_config());
        std::process::exit(0);
    }

    if let Some(matches) = matches.subcommand_matches("verify") {
        command_verify(matches);
        std::process::exit(0);
    }

    if let Some(matches) = matches.subcommand_matches("e2e") {
        command_e2e(matches);
        std::process::exit(0);
    }

    eprintln!("{}", matches.usage());
    std::process::exit(1);
}

/// Load configuration from the environment, exiting if it is incomplete
pub fn load_config() -> Config {
    Config::from_env().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    })
}

/// Read a file or exit
pub fn read_input(command: &str, matches: &clap::ArgMatches) -> Vec<u8> {
    let filename = match matches.value_of("INPUT") {
        Some(filename) => filename,
        None => {
            eprintln!("ballotledger {}: input filename required", command);
            std::process::exit(1);
        }
    };

    std::fs::read(filename).unwrap_or_else(|e| {
        eprintln!("ballotledger {}: unable to read {}: {}", command, filename, e);
        std::process::exit(1);
    })
}
