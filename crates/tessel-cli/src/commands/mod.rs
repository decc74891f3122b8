pub mod compile;
pub mod drivers;
pub mod dump;
pub mod run;

use camino::Utf8Path;
use color_eyre::eyre::{Result, WrapErr};

pub(crate) fn read_file(path: &Utf8Path) -> Result<Vec<u8>> {
    std::fs::read(path).wrap_err_with(|| format!("lecture de {path}"))
}
