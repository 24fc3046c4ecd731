//! Type checking.
//!
//! Computes both type slots of every expression, applying integer
//! promotions, usual arithmetic conversions, pointer arithmetic rules,
//! assignability, call checking, and return conformance. Every implicit
//! conversion is materialized as an explicit cast node so code generation
//! never reasons about conversions.

use crate::compiler::parser::ast::{
    Ast, BinaryOp, Block, BlockItem, Declaration, EntityArena, Expr, ExprKind, Stmt, TypeRef,
    TypeRefKind, UnaryOp, VarDef,
};
use crate::compiler::types::{Type, TypeId, TypeTable};
use crate::error::{Diagnostics, Error, Pos, Result};

use super::const_eval;

struct Checker<'a> {
    entities: &'a EntityArena,
    table: &'a mut TypeTable,
    diag: &'a mut Diagnostics,
    /// Return type of the function currently being checked.
    ret_ty: Option<TypeId>,
}

/// Type-checks the whole AST.
pub fn check(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    let mark = diag.error_count();

    let mut decls = std::mem::take(&mut ast.decls);
    let mut checker = Checker {
        entities: &ast.entities,
        table,
        diag,
        ret_ty: None,
    };

    for decl in &mut decls {
        match decl {
            Declaration::DefinedFunction(func) => {
                checker.ret_ty = func.ret.resolved;
                let body = &mut func.body;
                checker.check_block(body);
                checker.ret_ty = None;
            }
            Declaration::DefinedVariable(var) => {
                checker.check_static_init(var.ty.resolved, &mut var.init, var.pos);
            }
            Declaration::Constant(c) => {
                if let (Some(ty), Some(_)) = (c.ty.resolved, checker.type_expr(&mut c.value)) {
                    checker.check_assign(ty, &mut c.value, "constant definition");
                }
                if const_eval(&c.value).is_none() {
                    checker
                        .diag
                        .error(c.pos, "initializer is not a constant expression");
                }
            }
            _ => {}
        }
    }

    ast.decls = decls;
    diag.checkpoint(mark, Error::Semantic)
}

impl Checker<'_> {
    fn check_block(&mut self, block: &mut Block) {
        for item in &mut block.items {
            match item {
                BlockItem::Decl(var) => self.check_local(var),
                BlockItem::Stmt(stmt) => self.check_stmt(stmt),
            }
        }
    }

    fn check_local(&mut self, var: &mut VarDef) {
        if var.is_static {
            self.check_static_init(var.ty.resolved, &mut var.init, var.pos);
            return;
        }

        let Some(ty) = var.ty.resolved else { return };
        if let Some(init) = &mut var.init
            && self.type_expr(init).is_some()
        {
            self.check_assign(ty, init, "initialization");
        }
    }

    /// Statically allocated variables need constant initializers.
    fn check_static_init(&mut self, ty: Option<TypeId>, init: &mut Option<Expr>, pos: Pos) {
        let (Some(ty), Some(init)) = (ty, init) else {
            return;
        };

        if self.type_expr(init).is_some() {
            self.check_assign(ty, init, "initialization");
        }
        if const_eval(init).is_none() {
            self.diag
                .error(pos, "initializer is not a constant expression");
        }
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                self.type_expr(expr);
            }
            Stmt::Block(block) => self.check_block(block),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.check_cond_expr(cond);
                self.check_stmt(then);
                if let Some(e) = otherwise {
                    self.check_stmt(e);
                }
            }
            Stmt::While { cond, body, .. } => {
                self.check_cond_expr(cond);
                self.check_stmt(body);
            }
            Stmt::DoWhile { body, cond, .. } => {
                self.check_stmt(body);
                self.check_cond_expr(cond);
            }
            Stmt::For {
                init,
                init_decl,
                cond,
                step,
                body,
                ..
            } => {
                if let Some(decl) = init_decl {
                    self.check_local(decl);
                }
                if let Some(e) = init {
                    self.type_expr(e);
                }
                if let Some(e) = cond {
                    self.check_cond_expr(e);
                }
                if let Some(e) = step {
                    self.type_expr(e);
                }
                self.check_stmt(body);
            }
            Stmt::Switch {
                cond, body, cases, ..
            } => {
                if let Some(ty) = self.type_expr(cond) {
                    if self.table.is_integer(ty) {
                        let promoted = self.table.promote(ty);
                        self.insert_cast(cond, promoted);
                    } else {
                        self.diag
                            .error(cond.pos, "integer required in switch condition");
                    }
                }

                // Case values must be pairwise distinct within one switch.
                for (i, (value, _)) in cases.iter().enumerate() {
                    if cases[..i].iter().any(|(prev, _)| prev == value) {
                        self.diag
                            .error(cond.pos, format!("duplicate case value: {value}"));
                    }
                }

                self.check_stmt(body);
            }
            Stmt::Case { expr, stmt, .. } => {
                self.type_expr(expr);
                self.check_stmt(stmt);
            }
            Stmt::Default { stmt, .. } | Stmt::Label { stmt, .. } => self.check_stmt(stmt),
            Stmt::Return { expr, pos } => self.check_return(expr, *pos),
            Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Goto { .. } | Stmt::Empty => {}
        }
    }

    fn check_return(&mut self, expr: &mut Option<Expr>, pos: Pos) {
        let Some(ret) = self.ret_ty else { return };
        let ret_is_void = self.table.is_void(ret);

        match expr {
            None => {
                if !ret_is_void {
                    self.diag.error(pos, "return value required");
                }
            }
            Some(value) => {
                if ret_is_void {
                    self.diag
                        .error(pos, "returning value from void function");
                } else if self.type_expr(value).is_some() {
                    self.check_assign(ret, value, "return");
                }
            }
        }
    }

    /// Types a controlling expression and requires it to be scalar.
    fn check_cond_expr(&mut self, expr: &mut Expr) {
        if let Some(ty) = self.type_expr(expr) {
            let decayed = self.decay_value(expr, ty);
            if !self.table.is_scalar(decayed) {
                self.diag
                    .error(expr.pos, "integer or pointer condition required");
            }
        }
    }

    // ----- expression typing --------------------------------------------

    /// Computes and stores both type slots of `expr`, returning the
    /// effective type. `None` means a diagnostic was already reported
    /// somewhere beneath.
    fn type_expr(&mut self, expr: &mut Expr) -> Option<TypeId> {
        let ty = self.type_expr_inner(expr)?;
        expr.orig_ty = Some(ty);
        expr.ty = Some(ty);
        Some(ty)
    }

    fn type_expr_inner(&mut self, expr: &mut Expr) -> Option<TypeId> {
        let pos = expr.pos;

        match &mut expr.kind {
            ExprKind::IntLit { unsigned, long, .. } => Some(match (*unsigned, *long) {
                (false, false) => self.table.int(),
                (false, true) => self.table.long(),
                (true, false) => self.table.uint(),
                (true, true) => self.table.ulong(),
            }),
            ExprKind::StrLit(_) => {
                let c = self.table.char();
                Some(self.table.pointer_to(c))
            }
            ExprKind::Var { entity, .. } => {
                let id = (*entity)?;
                self.entities.get(id).ty
            }
            ExprKind::Unary { op, expr: inner } => {
                let op = *op;
                let ty = self.type_expr(inner)?;

                match op {
                    UnaryOp::Not => {
                        let decayed = self.decay_value(inner, ty);
                        if !self.table.is_scalar(decayed) {
                            self.diag.error(pos, "invalid operand of !");
                            return None;
                        }
                        Some(self.table.int())
                    }
                    _ => {
                        if !self.table.is_integer(ty) {
                            self.diag
                                .error(pos, format!("invalid operand of {}", op.as_str()));
                            return None;
                        }
                        let promoted = self.table.promote(ty);
                        self.insert_cast(inner, promoted);
                        Some(promoted)
                    }
                }
            }
            ExprKind::IncDec { inc, expr: inner, .. } => {
                let inc = *inc;
                let ty = self.type_expr(inner)?;
                if !self.table.is_scalar(ty) {
                    let op = if inc { "++" } else { "--" };
                    self.diag.error(pos, format!("invalid operand of {op}"));
                    return None;
                }
                Some(ty)
            }
            ExprKind::Deref(inner) => {
                let ty = self.type_expr(inner)?;
                let base = self.table.base_of(ty)?;
                if self.table.is_void(base) {
                    self.diag.error(pos, "dereferencing void pointer");
                    return None;
                }
                Some(base)
            }
            ExprKind::AddrOf(inner) => {
                let ty = self.type_expr(inner)?;
                Some(self.table.pointer_to(ty))
            }
            ExprKind::SizeofExpr(inner) => {
                let ty = self.type_expr(inner)?;
                if self.table.is_function(ty) || self.table.size_of(ty).is_none() {
                    self.diag.error(pos, "invalid sizeof operand");
                    return None;
                }
                Some(self.table.ulong())
            }
            ExprKind::SizeofType(ty_ref) => {
                let ty = ty_ref.resolved?;
                if self.table.is_function(ty) || self.table.size_of(ty).is_none() {
                    self.diag.error(pos, "invalid sizeof operand");
                    return None;
                }
                Some(self.table.ulong())
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                let lt = self.type_expr(lhs)?;
                let rt = self.type_expr(rhs)?;
                self.type_binary(op, lhs, lt, rhs, rt, pos)
            }
            ExprKind::Assign { lhs, rhs } => {
                let lt = self.type_expr(lhs)?;
                self.type_expr(rhs)?;
                self.check_assign(lt, rhs, "assignment");
                Some(lt)
            }
            ExprKind::OpAssign { op, lhs, rhs } => {
                let op = *op;
                let lt = self.type_expr(lhs)?;
                let rt = self.type_expr(rhs)?;

                if self.table.is_pointer(lt) {
                    if !matches!(op, BinaryOp::Add | BinaryOp::Sub) || !self.table.is_integer(rt)
                    {
                        self.diag
                            .error(pos, format!("invalid operands of {}=", op.as_str()));
                        return None;
                    }
                    let promoted = self.table.promote(rt);
                    self.insert_cast(rhs, promoted);
                } else if self.table.is_integer(lt) && self.table.is_integer(rt) {
                    let promoted = self.table.promote(rt);
                    self.insert_cast(rhs, promoted);
                } else {
                    self.diag
                        .error(pos, format!("invalid operands of {}=", op.as_str()));
                    return None;
                }

                Some(lt)
            }
            ExprKind::Cast { to, expr: inner } => {
                let it = self.type_expr(inner)?;
                let to = to.resolved?;

                let from = if self.table.is_array(it) {
                    let elem = self.table.base_of(it).expect("array element");
                    self.table.pointer_to(elem)
                } else {
                    it
                };

                let ok = self.table.is_void(to)
                    || self.table.same_type(to, from)
                    || (self.table.is_integer(to) && self.table.is_integer(from))
                    || (self.table.is_pointer(to) && self.table.is_pointer(from))
                    || (self.table.is_integer(to) && self.table.is_pointer(from))
                    || (self.table.is_pointer(to) && self.table.is_integer(from));

                if !ok {
                    self.diag.error(
                        pos,
                        format!(
                            "unsupported cast: {} to {}",
                            self.table.name_of(it),
                            self.table.name_of(to)
                        ),
                    );
                    return None;
                }

                Some(to)
            }
            ExprKind::Member { expr: base, name } => {
                let name = name.clone();
                let bt = self.type_expr(base)?;
                self.table.member_of(bt, &name).map(|(_, ty)| ty)
            }
            ExprKind::PtrMember { expr: base, name } => {
                let name = name.clone();
                let bt = self.type_expr(base)?;
                let inner = self.table.base_of(bt)?;
                self.table.member_of(inner, &name).map(|(_, ty)| ty)
            }
            ExprKind::Index { expr: base, index } => {
                let bt = self.type_expr(base)?;
                let it = self.type_expr(index)?;

                if !self.table.is_integer(it) {
                    self.diag.error(pos, "integer index required");
                    return None;
                }
                let promoted = self.table.promote(it);
                self.insert_cast(index, promoted);

                self.table.base_of(bt)
            }
            ExprKind::Call { func, args } => {
                let ft = self.type_expr(func)?;

                // Calling through a function pointer dereferences it.
                let fty = if self.table.is_pointer(ft) {
                    self.table.base_of(ft)?
                } else {
                    ft
                };

                let Type::Function {
                    ret,
                    params,
                    variadic,
                } = self.table.get(fty).clone()
                else {
                    self.diag.error(pos, "calling a non-function");
                    return None;
                };

                let arity_ok = if variadic {
                    args.len() >= params.len()
                } else {
                    args.len() == params.len()
                };
                if !arity_ok {
                    self.diag.error(
                        pos,
                        format!(
                            "wrong number of arguments: expected {}{}, got {}",
                            params.len(),
                            if variadic { "+" } else { "" },
                            args.len()
                        ),
                    );
                    return None;
                }

                for (arg, param_ty) in args.iter_mut().zip(params.iter()) {
                    if self.type_expr(arg).is_some() {
                        self.check_assign(*param_ty, arg, "argument");
                    }
                }

                // Trailing variadic arguments undergo the default argument
                // promotions.
                for arg in args.iter_mut().skip(params.len()) {
                    if let Some(ty) = self.type_expr(arg) {
                        let ty = self.decay_value(arg, ty);
                        if self.table.is_composite(ty) {
                            self.diag.error(
                                arg.pos,
                                "passing struct/union to a variadic function is not supported",
                            );
                        } else if self.table.is_integer(ty) {
                            let promoted = self.table.promote(ty);
                            self.insert_cast(arg, promoted);
                        }
                    }
                }

                Some(ret)
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                if let Some(ct) = self.type_expr(cond) {
                    let decayed = self.decay_value(cond, ct);
                    if !self.table.is_scalar(decayed) {
                        self.diag
                            .error(cond.pos, "integer or pointer condition required");
                    }
                }

                let tt = self.type_expr(then)?;
                let ot = self.type_expr(otherwise)?;
                let tt = self.decay_value(then, tt);
                let ot = self.decay_value(otherwise, ot);

                if self.table.is_integer(tt) && self.table.is_integer(ot) {
                    let common = self
                        .table
                        .usual_arith(self.table.promote(tt), self.table.promote(ot));
                    self.insert_cast(then, common);
                    self.insert_cast(otherwise, common);
                    Some(common)
                } else if self.table.same_type(tt, ot) {
                    Some(tt)
                } else if self.table.is_pointer(tt) && is_null_const(otherwise) {
                    self.insert_cast(otherwise, tt);
                    Some(tt)
                } else if self.table.is_pointer(ot) && is_null_const(then) {
                    self.insert_cast(then, ot);
                    Some(ot)
                } else {
                    self.diag
                        .error(pos, "type mismatch in conditional expression");
                    None
                }
            }
            ExprKind::Comma { lhs, rhs } => {
                self.type_expr(lhs);
                self.type_expr(rhs)
            }
        }
    }

    fn type_binary(
        &mut self,
        op: BinaryOp,
        lhs: &mut Expr,
        lt: TypeId,
        rhs: &mut Expr,
        rt: TypeId,
        pos: Pos,
    ) -> Option<TypeId> {
        let lt = self.decay_value(lhs, lt);
        let rt = self.decay_value(rhs, rt);

        match op {
            BinaryOp::LogAnd | BinaryOp::LogOr => {
                if !self.table.is_scalar(lt) || !self.table.is_scalar(rt) {
                    self.diag
                        .error(pos, format!("invalid operands of {}", op.as_str()));
                    return None;
                }
                Some(self.table.int())
            }
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => {
                if self.table.is_integer(lt) && self.table.is_integer(rt) {
                    let common = self
                        .table
                        .usual_arith(self.table.promote(lt), self.table.promote(rt));
                    self.insert_cast(lhs, common);
                    self.insert_cast(rhs, common);
                } else if self.table.is_pointer(lt) && is_null_const(rhs) {
                    self.insert_cast(rhs, lt);
                } else if self.table.is_pointer(rt) && is_null_const(lhs) {
                    self.insert_cast(lhs, rt);
                } else if self.table.is_pointer(lt) && self.table.is_pointer(rt) {
                    let lb = self.table.base_of(lt).expect("pointee");
                    let rb = self.table.base_of(rt).expect("pointee");
                    let compatible = self.table.same_type(lt, rt)
                        || self.table.is_void(lb)
                        || self.table.is_void(rb);
                    if !compatible {
                        self.diag.error(pos, "comparing unrelated pointer types");
                        return None;
                    }
                } else {
                    self.diag
                        .error(pos, format!("invalid operands of {}", op.as_str()));
                    return None;
                }
                Some(self.table.int())
            }
            BinaryOp::Add => {
                if self.table.is_pointer(lt) && self.table.is_integer(rt) {
                    self.check_pointer_arith(lt, pos)?;
                    let promoted = self.table.promote(rt);
                    self.insert_cast(rhs, promoted);
                    Some(lt)
                } else if self.table.is_integer(lt) && self.table.is_pointer(rt) {
                    self.check_pointer_arith(rt, pos)?;
                    let promoted = self.table.promote(lt);
                    self.insert_cast(lhs, promoted);
                    Some(rt)
                } else {
                    self.arith_common(op, lhs, lt, rhs, rt, pos)
                }
            }
            BinaryOp::Sub => {
                if self.table.is_pointer(lt) && self.table.is_integer(rt) {
                    self.check_pointer_arith(lt, pos)?;
                    let promoted = self.table.promote(rt);
                    self.insert_cast(rhs, promoted);
                    Some(lt)
                } else if self.table.is_pointer(lt) && self.table.is_pointer(rt) {
                    if !self.table.same_type(lt, rt) {
                        self.diag
                            .error(pos, "subtracting unrelated pointer types");
                        return None;
                    }
                    self.check_pointer_arith(lt, pos)?;
                    Some(self.table.long())
                } else {
                    self.arith_common(op, lhs, lt, rhs, rt, pos)
                }
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                if !self.table.is_integer(lt) || !self.table.is_integer(rt) {
                    self.diag
                        .error(pos, format!("invalid operands of {}", op.as_str()));
                    return None;
                }
                let lp = self.table.promote(lt);
                let rp = self.table.promote(rt);
                self.insert_cast(lhs, lp);
                self.insert_cast(rhs, rp);
                // The result type is the promoted left operand.
                Some(lp)
            }
            BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor => self.arith_common(op, lhs, lt, rhs, rt, pos),
        }
    }

    /// Usual arithmetic conversion for a symmetric integer operator.
    fn arith_common(
        &mut self,
        op: BinaryOp,
        lhs: &mut Expr,
        lt: TypeId,
        rhs: &mut Expr,
        rt: TypeId,
        pos: Pos,
    ) -> Option<TypeId> {
        if !self.table.is_integer(lt) || !self.table.is_integer(rt) {
            self.diag
                .error(pos, format!("invalid operands of {}", op.as_str()));
            return None;
        }

        let common = self
            .table
            .usual_arith(self.table.promote(lt), self.table.promote(rt));
        self.insert_cast(lhs, common);
        self.insert_cast(rhs, common);
        Some(common)
    }

    /// Pointer arithmetic needs a sized pointee to scale by.
    fn check_pointer_arith(&mut self, ptr: TypeId, pos: Pos) -> Option<()> {
        let base = self.table.base_of(ptr).expect("pointee");
        if self.table.size_of(base).is_none() {
            self.diag
                .error(pos, "pointer arithmetic on incomplete type");
            return None;
        }
        Some(())
    }

    // ----- conversions --------------------------------------------------

    /// Array-to-pointer decay in rvalue contexts, materialized as a cast.
    /// Returns the effective type.
    fn decay_value(&mut self, expr: &mut Expr, ty: TypeId) -> TypeId {
        if !self.table.is_array(ty) {
            return ty;
        }
        let elem = self.table.base_of(ty).expect("array element");
        let ptr = self.table.pointer_to(elem);
        self.insert_cast(expr, ptr);
        ptr
    }

    /// Checks that `from` may be implicitly converted to `to`, inserting the
    /// conversion cast. Reports a diagnostic otherwise.
    fn check_assign(&mut self, to: TypeId, from: &mut Expr, what: &str) -> bool {
        let Some(from_ty) = from.ty else { return false };
        let from_ty = self.decay_value(from, from_ty);

        if self.table.same_type(to, from_ty) {
            return true;
        }

        if self.table.is_integer(to) && self.table.is_integer(from_ty) {
            self.insert_cast(from, to);
            return true;
        }

        if self.table.is_pointer(to) && is_null_const(from) {
            self.insert_cast(from, to);
            return true;
        }

        if self.table.is_pointer(to) && self.table.is_pointer(from_ty) {
            let tb = self.table.base_of(to).expect("pointee");
            let fb = self.table.base_of(from_ty).expect("pointee");
            if self.table.is_void(tb) || self.table.is_void(fb) {
                self.insert_cast(from, to);
                return true;
            }
        }

        self.diag.error(
            from.pos,
            format!(
                "incompatible type in {what}: cannot convert {} to {}",
                self.table.name_of(from_ty),
                self.table.name_of(to)
            ),
        );
        false
    }

    /// Wraps `expr` in an explicit cast to `to` unless it already has that
    /// type.
    fn insert_cast(&mut self, expr: &mut Expr, to: TypeId) {
        if expr.ty == Some(to) {
            return;
        }

        let pos = expr.pos;
        let placeholder = Expr::new(
            ExprKind::IntLit {
                value: 0,
                unsigned: false,
                long: false,
            },
            pos,
        );
        let inner = std::mem::replace(expr, placeholder);

        let mut cast = Expr::new(
            ExprKind::Cast {
                to: self.synth_type_ref(to, pos),
                expr: Box::new(inner),
            },
            pos,
        );
        cast.orig_ty = Some(to);
        cast.ty = Some(to);
        *expr = cast;
    }

    /// Builds a resolved syntactic reference for a materialized cast.
    fn synth_type_ref(&self, ty: TypeId, pos: Pos) -> TypeRef {
        let kind = match self.table.get(ty) {
            Type::Void => TypeRefKind::Void,
            Type::Integer { name, .. } => match *name {
                "char" => TypeRefKind::Char,
                "unsigned char" => TypeRefKind::UChar,
                "short" => TypeRefKind::Short,
                "unsigned short" => TypeRefKind::UShort,
                "int" => TypeRefKind::Int,
                "unsigned int" => TypeRefKind::UInt,
                "long" => TypeRefKind::Long,
                _ => TypeRefKind::ULong,
            },
            Type::Pointer { base } => {
                TypeRefKind::Pointer(Box::new(self.synth_type_ref(*base, pos)))
            }
            _ => TypeRefKind::Named(self.table.name_of(ty)),
        };

        let mut ty_ref = TypeRef::new(kind, pos);
        ty_ref.resolved = Some(ty);
        ty_ref
    }
}

/// Is this the integer constant `0` (the null pointer constant)?
fn is_null_const(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::IntLit { value: 0, .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema;

    fn check_src(src: &str) -> (Result<()>, Ast, TypeTable, Diagnostics) {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        let resolved = sema::resolve(&mut ast, &mut table, &mut diag);
        let result = resolved.and_then(|()| check(&mut ast, &mut table, &mut diag));
        (result, ast, table, diag)
    }

    fn return_expr_of<'a>(ast: &'a Ast, name: &str) -> &'a Expr {
        let func = ast
            .defined_functions()
            .find(|f| f.name == name)
            .expect("function");
        for item in &func.body.items {
            if let BlockItem::Stmt(Stmt::Return {
                expr: Some(expr), ..
            }) = item
            {
                return expr;
            }
        }
        panic!("no return expression in {name}");
    }

    #[test]
    fn every_expression_gets_both_type_slots() {
        let (result, ast, table, _) =
            check_src("int main(void) { return 1 + 2 * 3; }");
        result.expect("check");

        let expr = return_expr_of(&ast, "main");
        assert_eq!(expr.ty, Some(table.int()));
        assert_eq!(expr.orig_ty, Some(table.int()));
    }

    #[test]
    fn narrow_operands_promote_to_int() {
        let (result, ast, table, _) = check_src(
            "int main(void) { char c; c = 'a'; return c + 1; }",
        );
        result.expect("check");

        // `c + 1` must wrap c in a cast to int.
        let expr = return_expr_of(&ast, "main");
        let ExprKind::Binary { lhs, .. } = &expr.kind else {
            panic!("expected binary");
        };
        assert!(matches!(lhs.kind, ExprKind::Cast { .. }));
        assert_eq!(lhs.ty, Some(table.int()));
    }

    #[test]
    fn unsigned_wins_width_tie() {
        let (result, ast, table, _) = check_src(
            "int main(void) { unsigned int u; int s; u = 1U; s = 1; return (u < s); }",
        );
        result.expect("check");

        let expr = return_expr_of(&ast, "main");
        let ExprKind::Binary { rhs, .. } = &expr.kind else {
            panic!("expected comparison");
        };
        assert_eq!(rhs.ty, Some(table.uint()));
    }

    #[test]
    fn assignment_materializes_conversion() {
        let (result, ast, _, _) = check_src(
            "int main(void) { long n; n = 1; return 0; }",
        );
        result.expect("check");

        let func = ast.defined_functions().next().expect("main");
        let BlockItem::Stmt(Stmt::Expr(expr)) = &func.body.items[1] else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { rhs, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(rhs.kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn null_constant_converts_to_pointer() {
        let (result, _, _, _) = check_src(
            "int main(void) { int *p; p = 0; return p == 0; }",
        );
        result.expect("check");
    }

    #[test]
    fn pointer_arithmetic_types() {
        let (result, ast, table, _) = check_src(
            "int main(void) { int a[4]; int *p; p = a; return *(p + 1) + (p - a); }",
        );
        result.expect("check");

        let _ = return_expr_of(&ast, "main");
        let _ = table;
    }

    #[test]
    fn return_without_value_in_int_function_is_error() {
        let (result, _, _, diag) = check_src("int main(void) { return; }");
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn returning_value_from_void_function_is_error() {
        let (result, _, _, _) = check_src(
            "void f(void) { return 1; } int main(void) { return 0; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn struct_assignment_to_int_is_error() {
        let (result, _, _, _) = check_src(
            "struct P { int x; }; int main(void) { struct P p; int n; n = p; return 0; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn call_arity_is_checked() {
        let (result, _, _, _) = check_src(
            "int add(int a, int b) { return a + b; } int main(void) { return add(1); }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn variadic_calls_allow_extra_arguments() {
        let (result, _, _, _) = check_src(
            "extern int printf(char *fmt, ...); int main(void) { printf(\"%d %d\", 1, 2); return 0; }",
        );
        result.expect("check");
    }

    #[test]
    fn switch_on_pointer_is_error() {
        let (result, _, _, _) = check_src(
            "int main(void) { int *p; p = 0; switch (p) { default: ; } return 0; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_case_values_are_error() {
        let (result, _, _, _) = check_src(
            "int main(void) { switch (1) { case 2: ; case 2: ; } return 0; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn comparing_unrelated_pointers_is_error() {
        let (result, _, _, _) = check_src(
            "struct A { int x; }; struct B { int y; };\n\
             int main(void) { struct A *a; struct B *b; a = 0; b = 0; return a == b; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn sizeof_function_is_error() {
        let (result, _, _, _) = check_src(
            "int f(void) { return 0; } int main(void) { return sizeof f; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn global_initializer_must_be_constant() {
        let (result, _, _, _) = check_src(
            "int g(void) { return 1; } int x = 1 + 2; int main(void) { return x; }",
        );
        result.expect("check");

        let (result, _, _, _) = check_src(
            "int y; int x = y; int main(void) { return x; }",
        );
        assert!(result.is_err());
    }
}
