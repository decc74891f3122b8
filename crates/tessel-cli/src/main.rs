//! main.rs — Binaire `tessel`.
//!
//! Sous-commandes :
//!   - compile     : IR texte → bytecode (binaire / JSON) ou IR après pipeline
//!   - run-module  : exécute les exports d’un module bytecode
//!   - run-ir      : compile puis exécute
//!   - dump-module : conteneur bytecode en JSON (ou désassemblé)
//!   - drivers     : pilotes HAL enregistrés
//!
//! Logs : `-v` / `-vv` / `-vvv`, ou `RUST_LOG` (prioritaire).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "tessel", version, about = "Chaîne tessel : compilateur, VM et runtime", long_about = None)]
struct Cli {
    /// Verbosité (répéter pour plus de bruit)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compiler un fichier IR
    Compile(commands::compile::Args),

    /// Exécuter un module bytecode
    RunModule(commands::run::ModuleArgs),

    /// Compiler puis exécuter un fichier IR
    RunIr(commands::run::IrArgs),

    /// Afficher un module bytecode
    DumpModule(commands::dump::Args),

    /// Lister les pilotes HAL
    Drivers,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Cmd::Compile(a) => commands::compile::exec(a),
        Cmd::RunModule(a) => commands::run::exec_module(a),
        Cmd::RunIr(a) => commands::run::exec_ir(a),
        Cmd::DumpModule(a) => commands::dump::exec(a),
        Cmd::Drivers => commands::drivers::exec(),
    }
}
