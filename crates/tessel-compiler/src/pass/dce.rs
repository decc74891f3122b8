//! pass/dce.rs — Élimination de code mort (ops pures, puis symboles).

use ahash::AHashSet;
use tracing::debug;

use super::{Pass, PassResult, PassScope};
use crate::context::CompilerContext;
use crate::ir::{Function, Module, OpKind};

/// Retire, jusqu’au point fixe, les ops pures dont aucun résultat n’est lu.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn scope(&self) -> PassScope {
        PassScope::Function
    }

    fn run_on_function(&self, function: &mut Function, _ctx: &CompilerContext) -> PassResult {
        loop {
            let used: AHashSet<String> =
                function.body.iter().flat_map(|op| op.operands()).map(str::to_string).collect();
            let before = function.body.len();
            function.body.retain(|op| !op.is_pure() || op.results.iter().any(|r| used.contains(r)));
            if function.body.len() == before {
                return Ok(());
            }
        }
    }
}

/// Ne garde que les fonctions atteignables (par appels) depuis les exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolDce;

impl Pass for SymbolDce {
    fn name(&self) -> &'static str {
        "symbol-dce"
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn run_on_module(&self, module: &mut Module, _ctx: &CompilerContext) -> PassResult {
        let mut live: AHashSet<String> = AHashSet::new();
        let mut worklist: Vec<String> =
            module.functions.iter().filter(|f| f.is_exported()).map(|f| f.name.clone()).collect();
        while let Some(name) = worklist.pop() {
            if !live.insert(name.clone()) {
                continue;
            }
            let Some(f) = module.function(&name) else { continue };
            for op in &f.body {
                if let OpKind::Call { callee, .. } = &op.kind {
                    if !live.contains(callee) {
                        worklist.push(callee.clone());
                    }
                }
            }
        }
        let before = module.functions.len();
        module.functions.retain(|f| live.contains(&f.name));
        let removed = before - module.functions.len();
        if removed > 0 {
            debug!(target: "tessel-compiler", removed, "fonctions non atteignables supprimées");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use indoc::indoc;

    const SRC: &str = indoc! {r#"
        func @main(%x: i32) -> i32 attributes {export} {
          %unused = constant 3 : i32
          %also = add %unused, %unused : i32
          %y = call @helper(%x) : i32
          trace "y"(%y)
          return %y : i32
        }
        func @helper(%a: i32) -> i32 {
          return %a : i32
        }
        func @orphan() -> i32 {
          %c = constant 1 : i32
          return %c : i32
        }
    "#};

    #[test]
    fn removes_dead_pure_ops_transitively() {
        let mut module = parse_module(SRC, "t.tsl").unwrap();
        let ctx = CompilerContext::new();
        DeadCodeElimination.run_on_function(&mut module.functions[0], &ctx).unwrap();
        let mnemonics: Vec<_> = module.functions[0].body.iter().map(|op| op.mnemonic()).collect();
        assert_eq!(mnemonics, ["call", "trace", "return"]);
    }

    #[test]
    fn drops_unreachable_functions() {
        let mut module = parse_module(SRC, "t.tsl").unwrap();
        SymbolDce.run_on_module(&mut module, &CompilerContext::new()).unwrap();
        let names: Vec<_> = module.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["main", "helper"]);
    }
}
