use camino::Utf8PathBuf;
use clap::Args as ClapArgs;
use color_eyre::eyre::{Result, WrapErr};

use tessel_bytecode::BytecodeModule;

use super::read_file;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Module bytecode binaire
    pub module: Utf8PathBuf,

    /// Désassemblage lisible au lieu du JSON
    #[arg(long)]
    pub disassemble: bool,
}

pub fn exec(args: Args) -> Result<()> {
    let bytes = read_file(&args.module)?;
    let mut module = BytecodeModule::from_bytes(&bytes).wrap_err_with(|| format!("décodage de {}", args.module))?;
    if args.disassemble {
        print!("{}", module.disassemble());
    } else {
        println!("{}", module.to_json()?);
    }
    Ok(())
}
