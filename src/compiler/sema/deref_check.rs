//! Dereference checking.
//!
//! Categorical checks that run after reference and type resolution but
//! before full expression typing: `*` and `[]` need a pointer or array
//! operand, `.` needs a struct/union, `->` a pointer to one, `&` an lvalue,
//! and assignment targets must be assignable lvalues.
//!
//! Types are derived shallowly here, without promotions or conversions;
//! the type checker recomputes them in full.

use crate::compiler::parser::ast::{
    Ast, Block, BlockItem, Declaration, EntityArena, EntityKind, Expr, ExprKind, Stmt,
};
use crate::compiler::types::{TypeId, TypeTable};
use crate::error::{Diagnostics, Error, Result};

struct Checker<'a> {
    entities: &'a EntityArena,
    table: &'a mut TypeTable,
    diag: &'a mut Diagnostics,
}

/// Validates operand categories across the AST.
pub fn check(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    let mark = diag.error_count();

    let mut checker = Checker {
        entities: &ast.entities,
        table,
        diag,
    };

    for decl in &ast.decls {
        match decl {
            Declaration::DefinedFunction(func) => checker.check_block(&func.body),
            Declaration::DefinedVariable(var) => {
                if let Some(init) = &var.init {
                    checker.check_expr(init);
                }
            }
            Declaration::Constant(c) => checker.check_expr(&c.value),
            _ => {}
        }
    }

    diag.checkpoint(mark, Error::Semantic)
}

impl Checker<'_> {
    fn check_block(&mut self, block: &Block) {
        for item in &block.items {
            match item {
                BlockItem::Decl(var) => {
                    if let Some(init) = &var.init {
                        self.check_expr(init);
                    }
                }
                BlockItem::Stmt(stmt) => self.check_stmt(stmt),
            }
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => self.check_expr(expr),
            Stmt::Block(block) => self.check_block(block),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond);
                self.check_stmt(then);
                if let Some(e) = otherwise {
                    self.check_stmt(e);
                }
            }
            Stmt::While { cond, body, .. } => {
                self.check_expr(cond);
                self.check_stmt(body);
            }
            Stmt::DoWhile { body, cond, .. } => {
                self.check_stmt(body);
                self.check_expr(cond);
            }
            Stmt::For {
                init,
                init_decl,
                cond,
                step,
                body,
                ..
            } => {
                if let Some(decl) = init_decl
                    && let Some(e) = &decl.init
                {
                    self.check_expr(e);
                }
                for expr in [init, cond, step].into_iter().flatten() {
                    self.check_expr(expr);
                }
                self.check_stmt(body);
            }
            Stmt::Switch { cond, body, .. } => {
                self.check_expr(cond);
                self.check_stmt(body);
            }
            Stmt::Case { expr, stmt, .. } => {
                self.check_expr(expr);
                self.check_stmt(stmt);
            }
            Stmt::Default { stmt, .. } | Stmt::Label { stmt, .. } => self.check_stmt(stmt),
            Stmt::Return { expr, .. } => {
                if let Some(e) = expr {
                    self.check_expr(e);
                }
            }
            Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Goto { .. } | Stmt::Empty => {}
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Deref(inner) => {
                self.check_expr(inner);
                if let Some(ty) = self.shallow_ty(inner)
                    && self.table.base_of(ty).is_none()
                {
                    self.diag.error(expr.pos, "dereferencing non-pointer");
                }
            }
            ExprKind::Index { expr: base, index } => {
                self.check_expr(base);
                self.check_expr(index);
                if let Some(ty) = self.shallow_ty(base)
                    && self.table.base_of(ty).is_none()
                {
                    self.diag.error(expr.pos, "indexing non-array value");
                }
            }
            ExprKind::Member { expr: base, name } => {
                self.check_expr(base);
                if let Some(ty) = self.shallow_ty(base) {
                    if !self.table.is_composite(ty) {
                        self.diag
                            .error(expr.pos, "accessing member of non-struct/union");
                    } else if self.table.member_of(ty, name).is_none() {
                        self.diag.error(
                            expr.pos,
                            format!("{} has no member named {name}", self.table.name_of(ty)),
                        );
                    }
                }
            }
            ExprKind::PtrMember { expr: base, name } => {
                self.check_expr(base);
                if let Some(ty) = self.shallow_ty(base) {
                    let pointee = self
                        .table
                        .base_of(ty)
                        .filter(|_| self.table.is_pointer(ty));
                    match pointee {
                        Some(inner) if self.table.is_composite(inner) => {
                            if self.table.member_of(inner, name).is_none() {
                                self.diag.error(
                                    expr.pos,
                                    format!(
                                        "{} has no member named {name}",
                                        self.table.name_of(inner)
                                    ),
                                );
                            }
                        }
                        _ => {
                            self.diag
                                .error(expr.pos, "-> applied to non-pointer-to-struct/union");
                        }
                    }
                }
            }
            ExprKind::AddrOf(inner) => {
                self.check_expr(inner);
                if !self.is_lvalue(inner) {
                    self.diag
                        .error(expr.pos, "cannot take address of non-lvalue");
                }
            }
            ExprKind::Assign { lhs, rhs } | ExprKind::OpAssign { lhs, rhs, .. } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
                if !self.is_lvalue(lhs) {
                    self.diag.error(expr.pos, "invalid lhs of assignment");
                } else if let Some(ty) = self.shallow_ty(lhs)
                    && self.table.is_array(ty)
                {
                    self.diag.error(expr.pos, "array is not assignable");
                }
            }
            ExprKind::IncDec { expr: inner, .. } => {
                self.check_expr(inner);
                if !self.is_lvalue(inner) {
                    self.diag
                        .error(expr.pos, "lvalue required as increment operand");
                }
            }
            ExprKind::Unary { expr: inner, .. } | ExprKind::SizeofExpr(inner) => {
                self.check_expr(inner);
            }
            ExprKind::Cast { expr: inner, .. } => self.check_expr(inner),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Comma { lhs, rhs } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
            }
            ExprKind::Call { func, args } => {
                self.check_expr(func);
                for arg in args {
                    self.check_expr(arg);
                }
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond);
                self.check_expr(then);
                self.check_expr(otherwise);
            }
            ExprKind::IntLit { .. } | ExprKind::StrLit(_) | ExprKind::Var { .. }
            | ExprKind::SizeofType(_) => {}
        }
    }

    /// Does the expression designate a storable location?
    fn is_lvalue(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Var { entity, .. } => entity
                .map(|id| self.entities.get(id).kind != EntityKind::Function)
                .unwrap_or(false),
            ExprKind::Deref(_) | ExprKind::Index { .. } | ExprKind::PtrMember { .. } => true,
            ExprKind::Member { expr, .. } => self.is_lvalue(expr),
            _ => false,
        }
    }

    /// Derives a type for category checks only: no promotions, no implicit
    /// conversions, `None` on anything it cannot see through.
    fn shallow_ty(&mut self, expr: &Expr) -> Option<TypeId> {
        match &expr.kind {
            ExprKind::IntLit { .. } => Some(self.table.int()),
            ExprKind::StrLit(_) => {
                let c = self.table.char();
                Some(self.table.pointer_to(c))
            }
            ExprKind::Var { entity, .. } => entity.and_then(|id| self.entities.get(id).ty),
            ExprKind::Deref(inner) => {
                let ty = self.shallow_ty(inner)?;
                self.table.base_of(ty)
            }
            ExprKind::Index { expr, .. } => {
                let ty = self.shallow_ty(expr)?;
                self.table.base_of(ty)
            }
            ExprKind::Member { expr, name } => {
                let ty = self.shallow_ty(expr)?;
                self.table.member_of(ty, name).map(|(_, ty)| ty)
            }
            ExprKind::PtrMember { expr, name } => {
                let ty = self.shallow_ty(expr)?;
                let inner = self.table.base_of(ty)?;
                self.table.member_of(inner, name).map(|(_, ty)| ty)
            }
            ExprKind::AddrOf(inner) => {
                let ty = self.shallow_ty(inner)?;
                Some(self.table.pointer_to(ty))
            }
            ExprKind::Cast { to, .. } => to.resolved,
            ExprKind::Assign { lhs, .. } | ExprKind::OpAssign { lhs, .. } => self.shallow_ty(lhs),
            ExprKind::Unary { expr, .. } | ExprKind::IncDec { expr, .. } => self.shallow_ty(expr),
            ExprKind::SizeofExpr(_) | ExprKind::SizeofType(_) => Some(self.table.ulong()),
            ExprKind::Binary { lhs, .. } => self.shallow_ty(lhs),
            ExprKind::Call { func, .. } => {
                let ty = self.shallow_ty(func)?;
                match self.table.get(ty) {
                    crate::compiler::types::Type::Function { ret, .. } => Some(*ret),
                    _ => None,
                }
            }
            ExprKind::Cond { then, .. } => self.shallow_ty(then),
            ExprKind::Comma { rhs, .. } => self.shallow_ty(rhs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema::{symbols, type_resolver};

    fn check_src(src: &str) -> (Result<()>, Diagnostics) {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        symbols::resolve(&mut ast, &mut diag).expect("symbols");
        type_resolver::resolve(&mut ast, &mut table, &mut diag).expect("types");
        let result = check(&mut ast, &mut table, &mut diag);
        (result, diag)
    }

    #[test]
    fn pointer_operations_pass() {
        let (result, _) = check_src(
            "int main(void) { int x; int *p; p = &x; *p = 3; return p[0]; }",
        );
        result.expect("check");
    }

    #[test]
    fn member_access_passes() {
        let (result, _) = check_src(
            "struct P { int x; }; int main(void) { struct P p; struct P *q; q = &p; p.x = 1; return q->x; }",
        );
        result.expect("check");
    }

    #[test]
    fn deref_of_int_is_error() {
        let (result, diag) = check_src("int main(void) { int x; return *x; }");
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn indexing_scalar_is_error() {
        let (result, _) = check_src("int main(void) { int x; return x[0]; }");
        assert!(result.is_err());
    }

    #[test]
    fn member_of_scalar_is_error() {
        let (result, _) = check_src("int main(void) { int x; return x.y; }");
        assert!(result.is_err());
    }

    #[test]
    fn arrow_on_value_is_error() {
        let (result, _) = check_src(
            "struct P { int x; }; int main(void) { struct P p; return p->x; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_member_is_error() {
        let (result, _) = check_src(
            "struct P { int x; }; int main(void) { struct P p; return p.zzz; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn address_of_literal_is_error() {
        let (result, _) = check_src("int main(void) { int *p; p = &3; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn assigning_to_rvalue_is_error() {
        let (result, _) = check_src("int main(void) { 3 = 4; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn assigning_to_array_is_error() {
        let (result, _) = check_src(
            "int main(void) { int a[2]; int b[2]; a = b; return 0; }",
        );
        assert!(result.is_err());
    }
}
