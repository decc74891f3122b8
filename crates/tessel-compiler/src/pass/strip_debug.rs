//! pass/strip_debug.rs — Efface les localisations du module.

use super::{Pass, PassResult, PassScope};
use crate::context::CompilerContext;
use crate::ir::{Location, Module};

#[derive(Debug, Clone, Copy, Default)]
pub struct StripDebugInfo;

impl Pass for StripDebugInfo {
    fn name(&self) -> &'static str {
        "strip-debuginfo"
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn run_on_module(&self, module: &mut Module, _ctx: &CompilerContext) -> PassResult {
        for f in &mut module.functions {
            f.loc = Location::Unknown;
            for op in &mut f.body {
                op.loc = Location::Unknown;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;

    #[test]
    fn every_location_becomes_unknown() {
        let mut module = parse_module("func @f() {\n  return\n} loc(\"a.tsl\":1:1)\n", "t.tsl").unwrap();
        StripDebugInfo.run_on_module(&mut module, &CompilerContext::new()).unwrap();
        let f = &module.functions[0];
        assert!(f.loc.is_unknown());
        assert!(f.body.iter().all(|op| op.loc.is_unknown()));
    }
}
