//! run.rs — `run-module` et `run-ir`.
//!
//! Chaque fonction exécutée affiche `EXEC @nom`, puis un résultat par ligne
//! au format des buffers décrits (`4xf32=1 2 3 4`, `i32=5`).

use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Args as ClapArgs;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;

use tessel_compiler::OutputFormat;
use tessel_runtime::shaped::{parse_inputs, ShapedBuffer};
use tessel_runtime::{load_module, Config};
use tessel_vm::{ModuleBuffer, VmModule};

use super::compile::{compile_file, CompileFlags};
use super::read_file;

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Fonction à exécuter (sinon tous les exports)
    #[arg(long)]
    pub entry_function: Option<String>,

    /// Pilotes HAL à essayer, séparés par des virgules
    #[arg(long)]
    pub driver: Option<String>,

    /// Entrées, une par argument (ex. "4xf32=1 2 3 4", "i32=5")
    #[arg(long = "inputs", num_args = 0..)]
    pub inputs: Vec<String>,
}

#[derive(ClapArgs, Debug)]
pub struct ModuleArgs {
    /// Module bytecode binaire
    pub module: Utf8PathBuf,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(ClapArgs, Debug)]
pub struct IrArgs {
    /// Fichier IR (.tsl)
    pub input: Utf8PathBuf,

    #[command(flatten)]
    pub flags: CompileFlags,

    #[command(flatten)]
    pub run: RunArgs,
}

pub fn exec_module(args: ModuleArgs) -> Result<()> {
    let bytes = read_file(&args.module)?;
    let module = VmModule::from_bytes(ModuleBuffer::new(bytes)).wrap_err_with(|| format!("chargement de {}", args.module))?;
    run_module(&module, &args.run, &mut std::io::stdout().lock())
}

pub fn exec_ir(args: IrArgs) -> Result<()> {
    let blob = compile_file(&args.input, &args.flags.overrides(Some(OutputFormat::BytecodeBinary)))?;
    let module = VmModule::from_bytes(ModuleBuffer::new(blob.bytes().to_vec()))?;
    run_module(&module, &args.run, &mut std::io::stdout().lock())
}

fn run_module(module: &VmModule, args: &RunArgs, out: &mut impl Write) -> Result<()> {
    let config = Arc::new(Config::new(args.driver.as_deref())?);
    info!(target: "tessel", driver = config.driver.name(), module = module.name(), "exécution");
    let bound = load_module(module, Some(config))?;

    let names = match &args.entry_function {
        Some(name) => vec![name.clone()],
        None => module.export_names(),
    };
    for name in names {
        let function = bound.function(&name)?;
        let inputs = parse_inputs(function.abi().inputs(), &args.inputs).wrap_err_with(|| format!("entrées de @{name}"))?;
        writeln!(out, "EXEC @{name}")?;
        for value in function.call(&inputs)?.into_vec() {
            writeln!(out, "{}", ShapedBuffer::from_host_value(&value)?)?;
        }
    }
    out.flush()?;
    Ok(())
}
