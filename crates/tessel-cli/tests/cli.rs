use std::path::Path;
use std::process::{Command, Output};

use anyhow::{ensure, Context, Result};
use indoc::indoc;
use pretty_assertions::assert_eq;

const MODEL: &str = indoc! {r#"
    module @model {
      func @simple_mul(%a: tensor<4xf32>, %b: tensor<4xf32>) -> tensor<4xf32> attributes {export} {
        %0 = mul %a, %b : tensor<4xf32>
        return %0 : tensor<4xf32>
      }
      func @twice(%x: i32) -> i32 attributes {export} {
        %two = constant 2 : i32
        %r = mul %x, %two : i32
        return %r : i32
      }
    }
"#};

fn tessel(args: &[&str]) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_tessel"))
        .args(args)
        .env_remove("TESSEL_TARGETS")
        .env_remove("TESSEL_OUTPUT")
        .env_remove("TESSEL_DEFAULT_DRIVER")
        .output()
        .context("lancement de tessel")
}

fn stdout_of(args: &[&str]) -> Result<String> {
    let out = tessel(args)?;
    ensure!(out.status.success(), "tessel {args:?} a échoué : {}", String::from_utf8_lossy(&out.stderr));
    Ok(String::from_utf8(out.stdout)?)
}

fn write_model(dir: &Path) -> Result<String> {
    let path = dir.join("model.tsl");
    std::fs::write(&path, MODEL)?;
    Ok(path.to_string_lossy().into_owned())
}

#[test]
fn compile_then_run_module() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_model(dir.path())?;
    let module = dir.path().join("model.tsbc").to_string_lossy().into_owned();
    stdout_of(&["compile", &input, "-o", &module])?;

    let out = stdout_of(&[
        "run-module",
        &module,
        "--driver",
        "interpreter",
        "--entry-function",
        "simple_mul",
        "--inputs",
        "4xf32=1 2 3 4",
        "[4]f32=2",
    ])?;
    assert_eq!(out, "EXEC @simple_mul\n4xf32=2 4 6 8\n");
    Ok(())
}

#[test]
fn run_ir_executes_the_requested_export() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_model(dir.path())?;
    let out = stdout_of(&["run-ir", &input, "--entry-function", "twice", "--inputs", "i32=21"])?;
    assert_eq!(out, "EXEC @twice\ni32=42\n");
    Ok(())
}

#[test]
fn dump_module_prints_the_json_container() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_model(dir.path())?;
    let module = dir.path().join("model.tsbc").to_string_lossy().into_owned();
    stdout_of(&["compile", &input, "-o", &module, "--strip-source-map"])?;

    let json: serde_json::Value = serde_json::from_str(&stdout_of(&["dump-module", &module])?)?;
    assert_eq!(json["name"], "model");
    let disasm = stdout_of(&["dump-module", &module, "--disassemble"])?;
    assert!(disasm.contains("simple_mul"), "{disasm}");
    Ok(())
}

#[test]
fn drivers_are_listed() -> Result<()> {
    let out = stdout_of(&["drivers"])?;
    assert_eq!(out.lines().collect::<Vec<_>>(), ["interpreter", "vmla"]);
    Ok(())
}

#[test]
fn unknown_targets_fail_before_compiling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_model(dir.path())?;
    let out = tessel(&["compile", &input, "--target", "cuda"])?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("unknown target backend 'cuda'"), "{stderr}");
    Ok(())
}

#[test]
fn ir_output_goes_to_stdout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_model(dir.path())?;
    let out = stdout_of(&["compile", &input, "--output-format", "ir", "--target", "vmla"])?;
    assert!(out.starts_with("module @model attributes {hal.targets = \"vmla\"}"), "{out}");
    Ok(())
}
