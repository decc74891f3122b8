use indoc::indoc;
use pretty_assertions::assert_eq;
use tessel_bytecode::BytecodeModule;
use tessel_compiler::error::{COMPILE_PREFIX, PARSE_PREFIX, RUN_PASSES_PREFIX};
use tessel_compiler::{CompileError, CompileOptions, CompilerContext, ModuleBundle, OutputFormat};

const ARITH: &str = indoc! {r#"
    module @arith {
      func @simple_mul(%a: tensor<4xf32>, %b: tensor<4xf32>) -> tensor<4xf32> attributes {export} {
        %0 = mul %a, %b : tensor<4xf32> loc("model.tsl":3:5)
        return %0 : tensor<4xf32>
      }
      func @counter(%n: i64) -> i64 attributes {export} {
        %one = constant 1 : i64
        %r = call @bump(%n, %one) : i64
        trace "counter"(%r)
        return %r : i64
      }
      func @bump(%x: i64, %y: i64) -> i64 {
        %s = add %x, %y : i64
        return %s : i64
      }
      func @unused() -> i32 {
        %c = constant 3 : i32
        return %c : i32
      }
    }
"#};

fn bundle(ctx: &CompilerContext) -> ModuleBundle {
    ctx.parse_asm_named(ARITH, "model.tsl").expect("fixture parses")
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn syntax_error_yields_an_error_report() {
    let ctx = CompilerContext::new();
    let err = ctx.parse_asm("func @f() {\n  bogus %x\n}\n").unwrap_err();
    assert!(err.is_invalid_argument());
    let report = err.to_string();
    assert!(report.starts_with(&format!("{PARSE_PREFIX}\n\n[ERROR]: custom op 'bogus' is unknown")), "{report}");
    assert!(report.contains("<asm>"), "{report}");
}

#[test]
fn verifier_errors_are_parse_errors() {
    let err = CompilerContext::new()
        .parse_asm("func @f(%a: i32) -> i32 {\n  %b = add %a, %missing : i32\n  return %b\n}\n")
        .unwrap_err();
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.to_string().contains("use of undefined value '%missing'"));
}

#[test]
fn malformed_descriptor_runs_no_pass() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    let before = b.to_asm(true, false, -1);
    let err = b.run_pass_pipeline(&["strip-debuginfo", "func(canonicalize", "dce"]).unwrap_err();
    assert!(matches!(err, CompileError::PipelineParse(_)));
    assert!(err.to_string().contains("unbalanced '('"));
    assert_eq!(b.to_asm(true, false, -1), before);
}

#[test]
fn pass_pipelines_mutate_in_place() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    b.run_pass_pipeline(&["symbol-dce", "strip-debuginfo"]).unwrap();
    assert!(b.module().function("unused").is_none());
    assert!(!b.to_asm(true, false, -1).contains("model.tsl"));
    assert_eq!(ctx.get_diagnostics(), "");
}

#[test]
fn failing_pass_reports_with_prefix() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    let err = b.run_pass_pipeline(&["hal-materialize-targets{targets=cuda}"]).unwrap_err();
    let report = err.to_string();
    assert!(report.starts_with(RUN_PASSES_PREFIX), "{report}");
    assert!(report.contains("unknown target backend 'cuda'"), "{report}");
}

#[test]
fn crash_reproducer_is_written_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repro.tsl");
    let ctx = CompilerContext::new();
    ctx.set_crash_reproducer_path(Some(path.clone()));

    let mut b = bundle(&ctx);
    let err = b.compile(&CompileOptions::default(), &strings(&["vulkan-spirv"])).unwrap_err();
    let report = err.to_string();
    assert!(report.starts_with(COMPILE_PREFIX), "{report}");
    assert!(report.contains("target backend 'vulkan-spirv' does not support element type i64 (used in @counter)"));
    assert!(report.contains("[NOTE]: crash reproducer written to"));
    assert!(!b.is_consumed());

    let repro = std::fs::read_to_string(&path).unwrap();
    assert!(repro.contains(
        "// pipeline: verify,canonicalize,dce,flow-materialize-reflection,\
         hal-materialize-targets{targets=vulkan-spirv},symbol-dce,canonicalize,dce"
    ));
    assert!(repro.contains("func @unused()"), "IR is captured before the pipeline runs");
    assert!(repro.contains("loc(\"model.tsl\":3:5)"));
}

#[test]
fn binary_compile_round_trips_through_the_container() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    let blob = b.compile(&CompileOptions::default(), &[]).unwrap();
    assert!(b.is_consumed());
    assert_eq!(ctx.get_diagnostics(), "");

    let m = BytecodeModule::from_bytes(blob.bytes()).unwrap();
    assert_eq!(m.name, "arith");
    let exports: Vec<_> = m.exports.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(exports, ["simple_mul", "counter"]);
    assert_eq!(m.functions.len(), 3, "symbol-dce drops @unused");

    let mul = &m.functions[0];
    let attr = |k: &str| mul.reflection.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
    assert_eq!(attr("fv"), Some("1"));
    assert_eq!(attr("f"), Some("I11!B3!d4B3!d4R6!B3!d4"));
    assert_eq!(mul.location_for_pc(0), Some("model.tsl:3:5"));
}

#[test]
fn second_compile_is_refused() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    b.compile(&CompileOptions::default(), &[]).unwrap();
    let err = b.compile(&CompileOptions::default(), &[]).unwrap_err();
    assert!(matches!(err, CompileError::AlreadyCompiled));
    assert!(err.is_failed_precondition());
    assert!(b.to_asm(false, false, -1).contains("func @simple_mul"));
}

#[test]
fn ir_text_output_reflects_the_pipeline() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    let opts = CompileOptions { output_format: OutputFormat::IrText, ..CompileOptions::default() };
    let blob = b.compile(&opts, &strings(&["vmla", "llvm-ir", "vmla"])).unwrap();
    let text = blob.text();
    assert!(text.starts_with("module @arith attributes {hal.targets = \"vmla,llvm-ir,vmla\"}"), "{text}");
    assert!(text.contains("reflection.fv = \"1\""));
    assert!(!text.contains("@unused"));
}

#[test]
fn text_container_honours_strip_flags() {
    let ctx = CompilerContext::new();
    let mut b = bundle(&ctx);
    let opts = CompileOptions {
        output_format: OutputFormat::BytecodeText,
        strip_debug_ops: true,
        strip_source_map: true,
        strip_symbols: true,
        ..CompileOptions::default()
    };
    let blob = b.compile(&opts, &[]).unwrap();
    let m = BytecodeModule::from_json(&blob.text()).unwrap();
    assert!(m.flags().stripped_symbols);
    let names: Vec<_> = m.functions.iter().map(|f| f.name.as_deref()).collect();
    assert_eq!(names, [Some("simple_mul"), Some("counter"), None]);
    assert!(m.functions.iter().all(|f| f.source_map.is_empty()));
    assert!(!m.disassemble().contains("trace"));
}
