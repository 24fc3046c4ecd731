//! Jump resolution.
//!
//! Walks each function body binding every jump to its target: `break` and
//! `continue` to the nearest enclosing loop/switch label, `goto` to a
//! function-scope label, and `case`/`default` to the switch that will
//! dispatch to them. Loop and switch statements receive unique labels that
//! code generation derives its jump targets from.
//!
//! Labels live in a separate namespace from ordinary identifiers, so they
//! are collected per function before any `goto` is linked; a use may precede
//! the declaration.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::compiler::parser::ast::{Ast, Block, BlockItem, Declaration, Stmt};
use crate::error::{Diagnostics, Error, Result};

use super::const_eval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtrlKind {
    Loop,
    Switch,
}

/// An open `switch` statement collecting its case labels.
#[derive(Debug, Default)]
struct SwitchFrame {
    label: String,
    cases: Vec<(i64, String)>,
    default: Option<String>,
}

#[derive(Debug, Default)]
struct JumpResolver {
    /// Enclosing loop/switch contexts, innermost last.
    ctrl: Vec<(String, CtrlKind)>,
    /// Open switch statements, innermost last. Separate from `ctrl` because
    /// `case` binds to the nearest switch even across loops.
    switches: Vec<SwitchFrame>,
    /// User label -> canonical label for the current function.
    labels: HashMap<String, String>,
    loop_count: usize,
    switch_count: usize,
    fn_name: String,
}

impl JumpResolver {
    fn reset(&mut self, fn_name: &str) {
        self.ctrl.clear();
        self.switches.clear();
        self.labels.clear();
        self.loop_count = 0;
        self.switch_count = 0;
        self.fn_name = fn_name.to_string();
    }

    fn new_loop_label(&mut self) -> String {
        let label = format!("{}.loop.{}", self.fn_name, self.loop_count);
        self.loop_count += 1;
        label
    }

    fn new_switch_label(&mut self) -> String {
        let label = format!("{}.switch.{}", self.fn_name, self.switch_count);
        self.switch_count += 1;
        label
    }

    /// Nearest enclosing loop or switch.
    fn current_ctrl(&self) -> Option<&(String, CtrlKind)> {
        self.ctrl.last()
    }

    /// Nearest enclosing loop, skipping switches.
    fn current_loop(&self) -> Option<&(String, CtrlKind)> {
        self.ctrl.iter().rev().find(|(_, k)| *k == CtrlKind::Loop)
    }
}

/// Binds all jumps within each function of the AST.
pub fn resolve(ast: &mut Ast, diag: &mut Diagnostics) -> Result<()> {
    let mark = diag.error_count();
    let mut resolver = JumpResolver::default();

    for decl in &mut ast.decls {
        let Declaration::DefinedFunction(func) = decl else {
            continue;
        };

        resolver.reset(&func.name);

        // Labels first, so a goto may precede its target.
        collect_labels(&mut func.body, &resolver.fn_name.clone(), &mut resolver, diag);

        resolve_block(&mut func.body, &mut resolver, diag);
    }

    diag.checkpoint(mark, Error::Semantic)
}

fn collect_labels(
    block: &mut Block,
    fn_name: &str,
    resolver: &mut JumpResolver,
    diag: &mut Diagnostics,
) {
    for item in &mut block.items {
        if let BlockItem::Stmt(stmt) = item {
            collect_stmt_labels(stmt, fn_name, resolver, diag);
        }
    }
}

fn collect_stmt_labels(
    stmt: &mut Stmt,
    fn_name: &str,
    resolver: &mut JumpResolver,
    diag: &mut Diagnostics,
) {
    match stmt {
        Stmt::Label {
            name,
            stmt,
            pos,
            canonical,
        } => {
            match resolver.labels.entry(name.clone()) {
                Entry::Occupied(_) => {
                    diag.error(*pos, format!("duplicate label '{name}'"));
                }
                Entry::Vacant(entry) => {
                    entry.insert(format!("{fn_name}.{name}"));
                }
            }
            *canonical = format!("{fn_name}.{name}");
            collect_stmt_labels(stmt, fn_name, resolver, diag);
        }
        Stmt::If { then, otherwise, .. } => {
            collect_stmt_labels(then, fn_name, resolver, diag);
            if let Some(e) = otherwise {
                collect_stmt_labels(e, fn_name, resolver, diag);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            collect_stmt_labels(body, fn_name, resolver, diag);
        }
        Stmt::Switch { body, .. } => collect_stmt_labels(body, fn_name, resolver, diag),
        Stmt::Case { stmt, .. } | Stmt::Default { stmt, .. } => {
            collect_stmt_labels(stmt, fn_name, resolver, diag);
        }
        Stmt::Block(block) => collect_labels(block, fn_name, resolver, diag),
        Stmt::Expr(_)
        | Stmt::Return { .. }
        | Stmt::Break { .. }
        | Stmt::Continue { .. }
        | Stmt::Goto { .. }
        | Stmt::Empty => {}
    }
}

fn resolve_block(block: &mut Block, resolver: &mut JumpResolver, diag: &mut Diagnostics) {
    for item in &mut block.items {
        if let BlockItem::Stmt(stmt) = item {
            resolve_stmt(stmt, resolver, diag);
        }
    }
}

fn resolve_stmt(stmt: &mut Stmt, resolver: &mut JumpResolver, diag: &mut Diagnostics) {
    match stmt {
        Stmt::Break { pos, label } => match resolver.current_ctrl() {
            Some((ctrl_label, _)) => *label = ctrl_label.clone(),
            None => diag.error(*pos, "break statement not within a loop or switch"),
        },
        Stmt::Continue { pos, label } => match resolver.current_loop() {
            Some((loop_label, _)) => *label = loop_label.clone(),
            None => diag.error(*pos, "continue statement not within a loop"),
        },
        Stmt::Goto {
            name,
            pos,
            canonical,
        } => match resolver.labels.get(name) {
            Some(target) => *canonical = target.clone(),
            None => diag.error(*pos, format!("label '{name}' used but not defined")),
        },
        Stmt::Label { stmt, .. } => resolve_stmt(stmt, resolver, diag),
        Stmt::While { body, label, .. }
        | Stmt::DoWhile { body, label, .. }
        | Stmt::For { body, label, .. } => {
            *label = resolver.new_loop_label();
            resolver.ctrl.push((label.clone(), CtrlKind::Loop));
            resolve_stmt(body, resolver, diag);
            resolver.ctrl.pop();
        }
        Stmt::Switch {
            body,
            cases,
            default_label,
            label,
            ..
        } => {
            *label = resolver.new_switch_label();
            resolver.ctrl.push((label.clone(), CtrlKind::Switch));
            resolver.switches.push(SwitchFrame {
                label: label.clone(),
                ..Default::default()
            });

            resolve_stmt(body, resolver, diag);

            resolver.ctrl.pop();
            let frame = resolver.switches.pop().expect("open switch frame");
            *cases = frame.cases;
            *default_label = frame.default;
        }
        Stmt::Case {
            expr,
            stmt,
            pos,
            label,
        } => {
            match resolver.switches.last_mut() {
                Some(frame) => match const_eval(expr) {
                    Some(value) => {
                        *label = format!("{}.case.{}", frame.label, frame.cases.len());
                        frame.cases.push((value, label.clone()));
                    }
                    None => diag.error(
                        *pos,
                        "case label does not reduce to an integer constant",
                    ),
                },
                None => diag.error(*pos, "case label not within a switch statement"),
            }
            resolve_stmt(stmt, resolver, diag);
        }
        Stmt::Default { stmt, pos, label } => {
            match resolver.switches.last_mut() {
                Some(frame) => {
                    if frame.default.is_some() {
                        diag.error(*pos, "multiple default labels in one switch");
                    } else {
                        *label = format!("{}.default", frame.label);
                        frame.default = Some(label.clone());
                    }
                }
                None => diag.error(*pos, "default label not within a switch statement"),
            }
            resolve_stmt(stmt, resolver, diag);
        }
        Stmt::If { then, otherwise, .. } => {
            resolve_stmt(then, resolver, diag);
            if let Some(e) = otherwise {
                resolve_stmt(e, resolver, diag);
            }
        }
        Stmt::Block(block) => resolve_block(block, resolver, diag),
        Stmt::Expr(_) | Stmt::Return { .. } | Stmt::Empty => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::ast::FunctionDef;
    use crate::compiler::parser::tests::parse_source;

    fn resolve_src(src: &str) -> (Result<()>, Ast, Diagnostics) {
        let mut ast = parse_source(src).expect("parse");
        let mut diag = Diagnostics::new();
        let result = resolve(&mut ast, &mut diag);
        (result, ast, diag)
    }

    fn main_fn(ast: &Ast) -> &FunctionDef {
        ast.defined_functions()
            .find(|f| f.name == "main")
            .expect("main")
    }

    #[test]
    fn loops_get_unique_labels() {
        let (result, ast, _) = resolve_src(
            "int main(void) { while (1) break; while (1) break; return 0; }",
        );
        result.expect("resolve");

        let func = main_fn(&ast);
        let labels: Vec<&str> = func
            .body
            .items
            .iter()
            .filter_map(|item| match item {
                BlockItem::Stmt(Stmt::While { label, .. }) => Some(label.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, ["main.loop.0", "main.loop.1"]);
    }

    #[test]
    fn break_binds_to_nearest_enclosing() {
        let (result, ast, _) = resolve_src(
            "int main(void) { while (1) { switch (1) { case 1: break; } break; } return 0; }",
        );
        result.expect("resolve");

        let func = main_fn(&ast);
        let BlockItem::Stmt(Stmt::While { body, label, .. }) = &func.body.items[0] else {
            panic!("expected while");
        };
        let Stmt::Block(inner) = &**body else {
            panic!("expected block");
        };
        // The second break escapes the loop, not the switch.
        let BlockItem::Stmt(Stmt::Break { label: break_label, .. }) = &inner.items[1] else {
            panic!("expected break");
        };
        assert_eq!(break_label, label);
    }

    #[test]
    fn continue_skips_switch_contexts() {
        let (result, ast, _) = resolve_src(
            "int main(void) { while (1) { switch (1) { default: continue; } } return 0; }",
        );
        result.expect("resolve");

        let func = main_fn(&ast);
        let BlockItem::Stmt(Stmt::While { label, .. }) = &func.body.items[0] else {
            panic!("expected while");
        };
        assert_eq!(label, "main.loop.0");
    }

    #[test]
    fn switch_collects_cases_and_default() {
        let (result, ast, _) = resolve_src(
            "int main(void) { switch (2) { case 1: return 1; case 2: return 2; default: return 0; } }",
        );
        result.expect("resolve");

        let func = main_fn(&ast);
        let BlockItem::Stmt(Stmt::Switch { cases, default_label, .. }) = &func.body.items[0]
        else {
            panic!("expected switch");
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].0, 1);
        assert_eq!(cases[1].0, 2);
        assert!(default_label.is_some());
    }

    #[test]
    fn goto_may_precede_its_label() {
        let (result, ast, _) =
            resolve_src("int main(void) { goto out; out: return 0; }");
        result.expect("resolve");

        let func = main_fn(&ast);
        let BlockItem::Stmt(Stmt::Goto { canonical, .. }) = &func.body.items[0] else {
            panic!("expected goto");
        };
        assert_eq!(canonical, "main.out");
    }

    #[test]
    fn break_outside_loop_is_error() {
        let (result, _, diag) = resolve_src("int main(void) { break; return 0; }");
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn continue_outside_loop_is_error() {
        let (result, _, _) = resolve_src("int main(void) { continue; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_label_is_error() {
        let (result, _, _) =
            resolve_src("int main(void) { x: ; x: return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn missing_goto_target_is_error() {
        let (result, _, _) = resolve_src("int main(void) { goto nowhere; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_default_is_error() {
        let (result, _, _) = resolve_src(
            "int main(void) { switch (1) { default: ; default: ; } return 0; }",
        );
        assert!(result.is_err());
    }
}
