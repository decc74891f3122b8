use color_eyre::eyre::Result;

use tessel_runtime::HalDriver;

pub fn exec() -> Result<()> {
    for name in HalDriver::query() {
        println!("{name}");
    }
    Ok(())
}
