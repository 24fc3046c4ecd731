//! Semantic Analysis
//!
//! The pass chain that turns a parsed AST into a checked one:
//!
//! 1. [`jumps`] binds `break`/`continue`/`goto`/labels and collects switch
//!    cases;
//! 2. [`symbols`] builds lexical scopes and binds every identifier use to its
//!    entity;
//! 3. [`type_resolver`] interns named types and attaches a resolved type to
//!    every typed node;
//! 4. the type table's own semantic check validates definitions;
//! 5. [`deref_check`] validates the operand categories of `*`, `[]`, `.`,
//!    `->`, `&` and assignment;
//! 6. [`type_check`] computes expression types and materializes implicit
//!    conversions.
//!
//! Steps 1-5 are the *resolution* half (`--dump-reference` shows their
//! result); step 6 is the *checking* half.

pub mod deref_check;
pub mod jumps;
pub mod symbols;
pub mod type_check;
pub mod type_resolver;

use log::debug;

use crate::compiler::parser::ast::{Ast, BinaryOp, Expr, ExprKind, UnaryOp};
use crate::compiler::types::TypeTable;
use crate::error::{Diagnostics, Error, Result};

/// Runs the resolution half of semantic analysis.
pub fn resolve(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    debug!("resolving jumps");
    jumps::resolve(ast, diag)?;

    debug!("resolving references");
    symbols::resolve(ast, diag)?;

    debug!("resolving types");
    type_resolver::resolve(ast, table, diag)?;

    let mark = diag.error_count();
    table.semantic_check(diag);
    diag.checkpoint(mark, Error::Semantic)?;

    debug!("checking dereferences");
    deref_check::check(ast, table, diag)
}

/// Runs the checking half of semantic analysis.
pub fn check(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    debug!("checking types");
    type_check::check(ast, table, diag)
}

/// Full semantic analysis: resolve, then check.
pub fn analyze(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    resolve(ast, table, diag)?;
    check(ast, table, diag)
}

/// Folds an integer constant expression, or returns `None` if the expression
/// is not constant. Works on unresolved trees, so `case` labels can be
/// evaluated before type checking.
pub fn const_eval(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit { value, .. } => Some(*value),
        ExprKind::Unary { op, expr } => {
            let v = const_eval(expr)?;
            Some(match op {
                UnaryOp::Plus => v,
                UnaryOp::Minus => v.wrapping_neg(),
                UnaryOp::BitNot => !v,
                UnaryOp::Not => (v == 0) as i64,
            })
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            Some(match op {
                BinaryOp::Add => l.wrapping_add(r),
                BinaryOp::Sub => l.wrapping_sub(r),
                BinaryOp::Mul => l.wrapping_mul(r),
                BinaryOp::Div => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_div(r)
                }
                BinaryOp::Mod => {
                    if r == 0 {
                        return None;
                    }
                    l.wrapping_rem(r)
                }
                BinaryOp::BitAnd => l & r,
                BinaryOp::BitOr => l | r,
                BinaryOp::BitXor => l ^ r,
                BinaryOp::Shl => l.wrapping_shl(r as u32),
                BinaryOp::Shr => l.wrapping_shr(r as u32),
                BinaryOp::LogAnd => (l != 0 && r != 0) as i64,
                BinaryOp::LogOr => (l != 0 || r != 0) as i64,
                BinaryOp::Eq => (l == r) as i64,
                BinaryOp::NotEq => (l != r) as i64,
                BinaryOp::Lt => (l < r) as i64,
                BinaryOp::Le => (l <= r) as i64,
                BinaryOp::Gt => (l > r) as i64,
                BinaryOp::Ge => (l >= r) as i64,
            })
        }
        ExprKind::Cond {
            cond,
            then,
            otherwise,
        } => {
            let c = const_eval(cond)?;
            if c != 0 {
                const_eval(then)
            } else {
                const_eval(otherwise)
            }
        }
        ExprKind::Cast { expr, .. } => const_eval(expr),
        ExprKind::Comma { rhs, .. } => const_eval(rhs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::parser::ast::{BlockItem, Declaration, Stmt};

    fn first_return_expr(src: &str) -> Expr {
        let ast = parse_source(src).expect("parse");
        let Declaration::DefinedFunction(func) = ast.decls.into_iter().next().expect("decl")
        else {
            panic!("expected function");
        };
        for item in func.body.items {
            if let BlockItem::Stmt(Stmt::Return {
                expr: Some(expr), ..
            }) = item
            {
                return expr;
            }
        }
        panic!("no return expression");
    }

    #[test]
    fn const_eval_folds_arithmetic() {
        let expr = first_return_expr("int main(void) { return 1 + 2 * 3 - (4 / 2); }");
        assert_eq!(const_eval(&expr), Some(5));
    }

    #[test]
    fn const_eval_folds_bitwise_and_logical() {
        let expr = first_return_expr("int main(void) { return (1 << 4) | (0xff & 0x0f); }");
        assert_eq!(const_eval(&expr), Some(31));
    }

    #[test]
    fn const_eval_rejects_variables() {
        let expr = first_return_expr("int main(void) { int x; return x + 1; }");
        assert_eq!(const_eval(&expr), None);
    }

    #[test]
    fn const_eval_rejects_division_by_zero() {
        let expr = first_return_expr("int main(void) { return 1 / 0; }");
        assert_eq!(const_eval(&expr), None);
    }

    #[test]
    fn full_pipeline_on_valid_program() {
        let mut ast = parse_source(
            "struct P { int x; int y; };\n\
             int add(int a, int b) { return a + b; }\n\
             int main(void) { struct P p; p.x = 1; p.y = 2; return add(p.x, p.y); }",
        )
        .expect("parse");

        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        analyze(&mut ast, &mut table, &mut diag).expect("analyze");
        assert_eq!(diag.error_count(), 0);
    }

    #[test]
    fn ast_dump_is_deterministic() {
        let src = "struct P { int x; };\n\
                   int main(void) { struct P p; p.x = 1; if (p.x) return 1; return 0; }";
        let first = parse_source(src).expect("parse").to_string();
        let second = parse_source(src).expect("parse").to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut ast = parse_source(
            "int main(void) { int i; for (i = 0; i < 4; i++) { continue; } return i; }",
        )
        .expect("parse");

        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        resolve(&mut ast, &mut table, &mut diag).expect("first resolve");

        let entities_before = ast.entities.len();
        resolve(&mut ast, &mut table, &mut diag).expect("second resolve");

        assert_eq!(diag.error_count(), 0);
        assert_eq!(ast.entities.len(), entities_before);
    }
}
