//! backend/flow.rs — Étape « flow » : métadonnées de réflexion ABI.
//!
//! Chaque fonction exportée reçoit `reflection.fv = "1"` et
//! `reflection.f = <signature manglée>` (voir `tessel_bytecode::abi`),
//! sauf si ces attributs sont déjà présents.

use tessel_bytecode::{Description, RawSignature};

use crate::context::CompilerContext;
use crate::diagnostics::Diagnostic;
use crate::ir::{Function, Module, Type};
use crate::pass::{Pass, PassFailure, PassResult, PassScope};

pub const PIPELINE: &str = "verify,canonicalize,dce,flow-materialize-reflection";

/// Version du format de réflexion.
pub const REFLECTION_VERSION: &str = "1";

/// Description ABI d’un type ; `Err(dim)` si une dimension statique dépasse `i32::MAX`.
pub fn describe_type(ty: &Type) -> Result<Description, u32> {
    match ty {
        Type::Scalar(k) => Ok(Description::scalar(k.scalar_type())),
        Type::Tensor { dims, element } => {
            let dims = dims
                .iter()
                .map(|d| match d {
                    Some(n) => i32::try_from(*n).map_err(|_| *n),
                    None => Ok(-1),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Description::buffer(element.scalar_type(), dims))
        }
    }
}

pub fn raw_signature(function: &Function) -> Result<RawSignature, u32> {
    Ok(RawSignature::new(
        function.param_types().map(describe_type).collect::<Result<_, _>>()?,
        function.results.iter().map(describe_type).collect::<Result<_, _>>()?,
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeReflection;

impl Pass for MaterializeReflection {
    fn name(&self) -> &'static str {
        "flow-materialize-reflection"
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn run_on_module(&self, module: &mut Module, ctx: &CompilerContext) -> PassResult {
        for f in module.functions.iter_mut().filter(|f| f.is_exported()) {
            if !f.has_attr("reflection.f") {
                let signature = raw_signature(f).map_err(|dim| {
                    ctx.emit(Diagnostic::error(
                        f.loc.clone(),
                        format!("dimension {dim} of @{} exceeds the ABI limit of {}", f.name, i32::MAX),
                    ));
                    PassFailure
                })?;
                f.set_attr("reflection.f", signature.mangle());
            }
            if !f.has_attr("reflection.fv") {
                f.set_attr("reflection.fv", REFLECTION_VERSION);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use tessel_bytecode::abi::signature_to_string;

    #[test]
    fn exported_functions_get_reflection() {
        let mut module = parse_module(
            "func @f(%a: tensor<4x?xf32>, %n: i32) -> tensor<4x?xf32> attributes {export} {\n  return %a\n}\n\
             func @g() {\n  return\n}\n",
            "t.tsl",
        )
        .unwrap();
        MaterializeReflection.run_on_module(&mut module, &CompilerContext::new()).unwrap();
        let f = &module.functions[0];
        assert_eq!(f.attr("reflection.fv"), Some("1"));
        let mangled = f.attr("reflection.f").unwrap();
        assert_eq!(RawSignature::parse(mangled).unwrap(), raw_signature(f).unwrap());
        assert!(signature_to_string(mangled).is_some());
        assert!(!module.functions[1].has_attr("reflection.f"));
    }

    #[test]
    fn existing_reflection_is_kept() {
        let mut module = parse_module(
            "func @f() attributes {export, reflection.f = \"custom\"} {\n  return\n}\n",
            "t.tsl",
        )
        .unwrap();
        MaterializeReflection.run_on_module(&mut module, &CompilerContext::new()).unwrap();
        assert_eq!(module.functions[0].attr("reflection.f"), Some("custom"));
    }

    #[test]
    fn oversized_static_dimension_is_an_error() {
        let mut module = parse_module(
            "func @big(%a: tensor<3000000000xi32>) attributes {export} {\n  return\n}\n",
            "t.tsl",
        )
        .unwrap();
        let ctx = CompilerContext::new();
        let capture = ctx.capture_diagnostics();
        assert_eq!(MaterializeReflection.run_on_module(&mut module, &ctx), Err(PassFailure));
        let diags = capture.take();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "dimension 3000000000 of @big exceeds the ABI limit of 2147483647");
        assert!(!module.functions[0].has_attr("reflection.f"));
    }
}
