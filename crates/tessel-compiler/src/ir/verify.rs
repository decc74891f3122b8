//! ir/verify.rs — Vérification structurelle et typage de l’IR.
//!
//! Retourne toutes les erreurs trouvées (une par problème), dans l’ordre
//! du module. Un module vérifié peut être abaissé sans autre contrôle.

use ahash::{AHashMap, AHashSet};
use tessel_bytecode::ScalarKind;

use super::{Constant, Function, Module, Number, OpKind, Operation, Type};
use crate::diagnostics::Diagnostic;

pub fn verify_module(module: &Module) -> Vec<Diagnostic> {
    let mut errors = Vec::new();
    let mut seen = AHashSet::new();
    for f in &module.functions {
        if !seen.insert(f.name.as_str()) {
            errors.push(Diagnostic::error(f.loc.clone(), format!("redefinition of symbol '@{}'", f.name)));
        }
    }
    for f in &module.functions {
        verify_function(module, f, &mut errors);
    }
    errors
}

fn join_types<'a>(types: impl IntoIterator<Item = &'a Type>) -> String {
    types.into_iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn verify_function(module: &Module, f: &Function, errors: &mut Vec<Diagnostic>) {
    let mut env: AHashMap<&str, &Type> = AHashMap::new();
    for (name, ty) in &f.params {
        if env.insert(name.as_str(), ty).is_some() {
            errors.push(Diagnostic::error(f.loc.clone(), format!("redefinition of value '%{name}' in @{}", f.name)));
        }
    }

    match f.body.last() {
        Some(op) if op.is_return() => {}
        _ => errors.push(Diagnostic::error(
            f.loc.clone(),
            format!("function @{} must end with a 'return'", f.name),
        )),
    }

    let last = f.body.len().saturating_sub(1);
    for (index, op) in f.body.iter().enumerate() {
        let mut err = |msg: String| errors.push(Diagnostic::error(op.loc.clone(), msg));

        let mut operand_types = Vec::new();
        for name in op.operands() {
            match env.get(name) {
                Some(t) => operand_types.push(*t),
                None => err(format!("use of undefined value '%{name}'")),
            }
        }
        if operand_types.len() != op.operands().len() {
            continue;
        }

        if op.is_return() && index != last {
            err(format!("'return' must be the last operation of @{}", f.name));
        }

        match &op.kind {
            OpKind::Constant(_) | OpKind::Binary { .. } | OpKind::Unary { .. } if op.types.len() != 1 => {
                err(format!("'{}' op must declare exactly one result type", op.mnemonic()));
            }
            OpKind::Constant(constant) => {
                if let Some(msg) = check_constant(constant, &op.types[0]) {
                    err(msg);
                }
            }
            OpKind::Binary { .. } | OpKind::Unary { .. } => {
                let result = &op.types[0];
                if operand_types.iter().any(|t| *t != result) {
                    err(format!(
                        "'{}' op operand types ({}) do not match result type {result}",
                        op.mnemonic(),
                        join_types(operand_types.iter().copied())
                    ));
                }
            }
            OpKind::Call { callee, .. } => match module.function(callee) {
                None => err(format!("call to unknown function '@{callee}'")),
                Some(target) => {
                    let params: Vec<&Type> = target.param_types().collect();
                    if params != operand_types {
                        err(format!(
                            "call to '@{callee}' passes ({}) but it expects ({})",
                            join_types(operand_types.iter().copied()),
                            join_types(params)
                        ));
                    }
                    if target.results != op.types {
                        err(format!(
                            "call to '@{callee}' declares results ({}) but it returns ({})",
                            join_types(&op.types),
                            join_types(&target.results)
                        ));
                    }
                    if op.results.len() != op.types.len() {
                        err(format!(
                            "call to '@{callee}' binds {} value(s) for {} result(s)",
                            op.results.len(),
                            op.types.len()
                        ));
                    }
                }
            },
            OpKind::Trace { .. } => {}
            OpKind::Return { .. } => {
                let declared: Vec<&Type> = op.types.iter().collect();
                if declared != operand_types || op.types != f.results {
                    err(format!(
                        "'return' op types ({}) do not match function results ({})",
                        join_types(operand_types.iter().copied()),
                        join_types(&f.results)
                    ));
                }
            }
        }

        define_results(op, &mut env, errors);
    }
}

fn define_results<'a>(op: &'a Operation, env: &mut AHashMap<&'a str, &'a Type>, errors: &mut Vec<Diagnostic>) {
    for (name, ty) in op.results.iter().zip(&op.types) {
        if env.insert(name.as_str(), ty).is_some() {
            errors.push(Diagnostic::error(op.loc.clone(), format!("redefinition of value '%{name}'")));
        }
    }
}

fn check_literal(n: Number, kind: ScalarKind) -> Option<String> {
    match (n, kind) {
        (Number::Float(x), ScalarKind::I32 | ScalarKind::I64) => {
            Some(format!("float literal {x:?} is not valid for {}", kind.mnemonic()))
        }
        (Number::Int(i), ScalarKind::I32) if i32::try_from(i).is_err() => {
            Some(format!("integer literal {i} does not fit in i32"))
        }
        _ => None,
    }
}

fn check_constant(constant: &Constant, ty: &Type) -> Option<String> {
    match (constant, ty) {
        (Constant::Scalar(n), Type::Scalar(kind)) => check_literal(*n, *kind),
        (Constant::Scalar(_), Type::Tensor { .. }) => {
            Some(format!("scalar constant cannot produce {ty}; use dense<[...]>"))
        }
        (Constant::Dense(_), Type::Scalar(_)) => Some(format!("dense constant requires a tensor type, found {ty}")),
        (Constant::Dense(values), Type::Tensor { element, .. }) => {
            let Some(count) = ty.static_element_count() else {
                return Some(format!("dense constant requires a static shape, found {ty}"));
            };
            if values.len() != count {
                return Some(format!("dense literal has {} element(s) but {ty} holds {count}", values.len()));
            }
            values.iter().find_map(|n| check_literal(*n, *element))
        }
    }
}
