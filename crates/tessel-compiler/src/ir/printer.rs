//! ir/printer.rs — Rendu texte de l’IR (forme ré-analysable par `parser`).

use std::fmt::Write as _;

use super::{quote, Attribute, Constant, Function, Location, Module, OpKind, Operation, Type};

pub const ELIDED_MARKER: &str = "__elided__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintOptions {
    /// Imprime les localisations.
    pub debug_info: bool,
    /// Localisations en commentaires `// at …` plutôt qu’en `loc(...)`.
    pub pretty: bool,
    /// Seuil d’élision des constantes `dense` ; négatif = jamais.
    pub large_element_limit: i64,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self { debug_info: false, pretty: false, large_element_limit: -1 }
    }
}

pub fn print_module(module: &Module, opts: PrintOptions) -> String {
    let mut out = String::from("module");
    if let Some(name) = &module.name {
        let _ = write!(out, " @{name}");
    }
    if !module.attrs.is_empty() {
        let _ = write!(out, " attributes {}", attr_dict(&module.attrs));
    }
    out.push_str(" {\n");
    for f in &module.functions {
        print_function(f, opts, &mut out);
    }
    out.push_str("}\n");
    out
}

fn attr_dict(attrs: &[Attribute]) -> String {
    let items: Vec<String> = attrs
        .iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{k} = {}", quote(v)),
            None => k.clone(),
        })
        .collect();
    format!("{{{}}}", items.join(", "))
}

fn join<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items.into_iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

fn values(names: &[String]) -> String {
    join(names.iter().map(|n| format!("%{n}")))
}

fn location_suffix(loc: &Location, opts: PrintOptions) -> String {
    match (opts.debug_info, opts.pretty) {
        (false, _) => String::new(),
        (true, false) => format!(" loc({loc})"),
        (true, true) if loc.is_unknown() => String::new(),
        (true, true) => format!("  // at {}", loc.brief()),
    }
}

fn print_function(f: &Function, opts: PrintOptions, out: &mut String) {
    let params = join(f.params.iter().map(|(n, t)| format!("%{n}: {t}")));
    let _ = write!(out, "  func @{}({params})", f.name);
    match f.results.as_slice() {
        [] => {}
        [single] => {
            let _ = write!(out, " -> {single}");
        }
        many => {
            let _ = write!(out, " -> ({})", join(many));
        }
    }
    if !f.attrs.is_empty() {
        let _ = write!(out, " attributes {}", attr_dict(&f.attrs));
    }
    out.push_str(" {\n");
    for op in &f.body {
        let _ = writeln!(out, "    {}{}", print_op(op, opts), location_suffix(&op.loc, opts));
    }
    let _ = writeln!(out, "  }}{}", location_suffix(&f.loc, opts));
}

fn print_constant(constant: &Constant, opts: PrintOptions) -> String {
    match constant {
        Constant::Scalar(n) => n.to_string(),
        Constant::Dense(values) => {
            let elide = usize::try_from(opts.large_element_limit).is_ok_and(|limit| values.len() > limit);
            if elide {
                format!("dense<\"{ELIDED_MARKER}\">")
            } else {
                format!("dense<[{}]>", join(values))
            }
        }
    }
}

pub fn print_op(op: &Operation, opts: PrintOptions) -> String {
    let lhs = if op.results.is_empty() { String::new() } else { format!("{} = ", values(&op.results)) };
    let types = |types: &[Type]| if types.is_empty() { String::new() } else { format!(" : {}", join(types)) };
    let body = match &op.kind {
        OpKind::Constant(c) => format!("constant {}{}", print_constant(c, opts), types(&op.types)),
        OpKind::Binary { op: b, lhs, rhs } => format!("{} %{lhs}, %{rhs}{}", b.mnemonic(), types(&op.types)),
        OpKind::Unary { op: u, operand } => format!("{} %{operand}{}", u.mnemonic(), types(&op.types)),
        OpKind::Call { callee, args } => format!("call @{callee}({}){}", values(args), types(&op.types)),
        OpKind::Trace { tag, args } => format!("trace {}({})", quote(tag), values(args)),
        OpKind::Return { values: vs } if vs.is_empty() => "return".to_string(),
        OpKind::Return { values: vs } => format!("return {}{}", values(vs), types(&op.types)),
    };
    format!("{lhs}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const SRC: &str = indoc! {r#"
        module @m attributes {hal.targets = "vmla"} {
          func @f(%a: tensor<4xf32>) -> (tensor<4xf32>, i32) attributes {export} {
            %c = constant dense<[1.0, 2.0, 3.0, 4.0]> : tensor<4xf32> loc("m.tsl":2:3)
            %0 = add %a, %c : tensor<4xf32> loc("m.tsl":3:3)
            %n = constant 7 : i32 loc(unknown)
            trace "dbg"(%0, %n) loc("m.tsl":5:3)
            return %0, %n : tensor<4xf32>, i32 loc("m.tsl":6:3)
          } loc("m.tsl":1:1)
        }
    "#};

    #[test]
    fn debug_form_reparses_identically() {
        let m = parse_module(SRC, "<asm>").unwrap();
        let opts = PrintOptions { debug_info: true, ..PrintOptions::default() };
        let text = print_module(&m, opts);
        assert_eq!(text, SRC);
        assert_eq!(parse_module(&text, "<asm>").unwrap(), m);
    }

    #[test]
    fn plain_and_pretty_forms() {
        let m = parse_module(SRC, "<asm>").unwrap();
        let plain = print_module(&m, PrintOptions::default());
        assert!(plain.contains("    %0 = add %a, %c : tensor<4xf32>\n"));
        assert!(!plain.contains("loc("));

        let pretty = print_module(&m, PrintOptions { debug_info: true, pretty: true, large_element_limit: 2 });
        assert!(pretty.contains("%0 = add %a, %c : tensor<4xf32>  // at m.tsl:3:3\n"));
        assert!(pretty.contains("    %n = constant 7 : i32\n"));
        assert!(pretty.contains("constant dense<\"__elided__\"> : tensor<4xf32>"));
    }
}
