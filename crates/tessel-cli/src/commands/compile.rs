use std::io::Write;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use clap::Args as ClapArgs;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;

use tessel_compiler::{CliOverrides, CompilerContext, Config, OpaqueBlob, OutputFormat};

/// Options de compilation partagées par `compile` et `run-ir`.
#[derive(ClapArgs, Debug, Default)]
pub struct CompileFlags {
    /// Backends cibles (répétable ou séparés par des virgules)
    #[arg(long = "target", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Désactive canonicalize/dce autour de l’abaissement
    #[arg(long)]
    pub no_optimize: bool,

    /// Retire les ops `trace`
    #[arg(long)]
    pub strip_debug_ops: bool,

    /// Retire les source maps
    #[arg(long)]
    pub strip_source_map: bool,

    /// Retire les noms de fonctions internes
    #[arg(long)]
    pub strip_symbols: bool,

    /// Écrit un reproducteur si une pipeline échoue
    #[arg(long)]
    pub crash_reproducer: Option<PathBuf>,
}

impl CompileFlags {
    pub fn overrides(&self, output_format: Option<OutputFormat>) -> CliOverrides {
        CliOverrides {
            targets: (!self.targets.is_empty()).then(|| self.targets.clone()),
            output_format,
            optimize: self.no_optimize.then_some(false),
            strip_debug_ops: self.strip_debug_ops.then_some(true),
            strip_source_map: self.strip_source_map.then_some(true),
            strip_symbols: self.strip_symbols.then_some(true),
            crash_reproducer: self.crash_reproducer.clone(),
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Fichier IR (.tsl)
    pub input: Utf8PathBuf,

    /// Fichier de sortie (sinon stdout)
    #[arg(short, long)]
    pub output: Option<Utf8PathBuf>,

    /// binary | text | ir
    #[arg(long)]
    pub output_format: Option<OutputFormat>,

    #[command(flatten)]
    pub flags: CompileFlags,
}

/// Defaults → ENV → overrides, puis compilation de `input`.
pub(crate) fn compile_file(input: &Utf8PathBuf, overrides: &CliOverrides) -> Result<OpaqueBlob> {
    let mut config = Config::from_env();
    config.apply_cli_overrides(overrides);
    config.validate()?;
    if config.crash_reproducer.is_some() {
        CompilerContext::set_default_crash_reproducer_path(config.crash_reproducer.clone());
    }

    let ctx = CompilerContext::new();
    let mut bundle = ctx.parse_asm_file(input.as_std_path())?;
    let blob = bundle.compile(&config.compile_options(), &config.targets)?;
    info!(target: "tessel", input = %input, bytes = blob.bytes().len(), format = %config.output_format, "compilation terminée");
    Ok(blob)
}

pub fn exec(args: Args) -> Result<()> {
    let blob = compile_file(&args.input, &args.flags.overrides(args.output_format))?;
    match &args.output {
        Some(path) => std::fs::write(path, blob.bytes()).wrap_err_with(|| format!("écriture de {path}"))?,
        None => {
            let mut out = std::io::stdout().lock();
            out.write_all(blob.bytes())?;
            out.flush()?;
        }
    }
    Ok(())
}
