//! Type resolution.
//!
//! Interns every named type in the table and attaches a resolved [`TypeId`]
//! to each typed node: declarations, parameters, casts, and `sizeof`
//! operands. Struct and union shells are registered before member types are
//! resolved, so mutually referential definitions work through pointers.
//! Typedef chains flatten at registration.

use crate::compiler::parser::ast::{
    Ast, Block, BlockItem, Declaration, EntityArena, EntityId, Expr, ExprKind, Stmt, TypeRef,
    TypeRefKind, VarDef,
};
use crate::compiler::types::{MemberType, Type, TypeId, TypeKey, TypeTable};
use crate::error::{Diagnostics, Error, Pos, Result};

/// Attaches resolved types to the whole AST.
///
/// A second run over an already-resolved AST is a no-op.
pub fn resolve(ast: &mut Ast, table: &mut TypeTable, diag: &mut Diagnostics) -> Result<()> {
    if already_resolved(ast) {
        return Ok(());
    }

    let mark = diag.error_count();

    // Phase 1a: composite shells, so members may reference any struct/union
    // of the unit.
    for decl in &ast.decls {
        match decl {
            Declaration::StructDef(def) => {
                let key = TypeKey::Struct(def.name.clone());
                if table.is_defined(&key) {
                    diag.error(def.pos, format!("duplicated type definition: {key}"));
                    continue;
                }
                table.define_composite(
                    key,
                    Type::Struct {
                        name: def.name.clone(),
                        members: vec![],
                    },
                );
            }
            Declaration::UnionDef(def) => {
                let key = TypeKey::Union(def.name.clone());
                if table.is_defined(&key) {
                    diag.error(def.pos, format!("duplicated type definition: {key}"));
                    continue;
                }
                table.define_composite(
                    key,
                    Type::Union {
                        name: def.name.clone(),
                        members: vec![],
                    },
                );
            }
            _ => {}
        }
    }

    // Phase 1b: member types and typedef targets, in source order.
    let mut decls = std::mem::take(&mut ast.decls);
    for decl in &mut decls {
        match decl {
            Declaration::StructDef(def) => {
                let Some(id) = table.lookup(&TypeKey::Struct(def.name.clone())) else {
                    continue;
                };
                let mut members = vec![];
                for member in &mut def.members {
                    if let Some(ty) = resolve_ref(&mut member.ty, table, diag) {
                        members.push(MemberType {
                            name: member.name.clone(),
                            ty,
                            pos: member.pos,
                        });
                    }
                }
                table.set_members(id, members);
            }
            Declaration::UnionDef(def) => {
                let Some(id) = table.lookup(&TypeKey::Union(def.name.clone())) else {
                    continue;
                };
                let mut members = vec![];
                for member in &mut def.members {
                    if let Some(ty) = resolve_ref(&mut member.ty, table, diag) {
                        members.push(MemberType {
                            name: member.name.clone(),
                            ty,
                            pos: member.pos,
                        });
                    }
                }
                table.set_members(id, members);
            }
            Declaration::TypeDef(def) => {
                let key = TypeKey::Plain(def.name.clone());
                if table.is_defined(&key) {
                    diag.error(def.pos, format!("duplicated type definition: {key}"));
                    continue;
                }
                if let Some(target) = resolve_ref(&mut def.ty, table, diag) {
                    table.define_alias(def.name.clone(), target);
                }
            }
            _ => {}
        }
    }

    // Phase 2: declarations and bodies.
    let entities = &mut ast.entities;
    for decl in &mut decls {
        match decl {
            Declaration::DefinedFunction(func) => {
                let ret = resolve_ref(&mut func.ret, table, diag);

                let mut param_tys = vec![];
                for param in &mut func.params {
                    let Some(ty) = resolve_param(&mut param.ty, table, diag) else {
                        continue;
                    };
                    param_tys.push(ty);
                    if let Some(id) = param.entity {
                        set_entity_ty(entities, id, ty, param.pos, table, diag);
                    }
                }

                if let Some(ret) = ret {
                    if table.is_array(ret) {
                        diag.error(func.pos, "function returns an array");
                        continue;
                    }
                    if table.is_composite(ret) {
                        diag.error(func.pos, "returning struct/union by value is not supported");
                        continue;
                    }
                    let fn_ty = table.function(ret, param_tys, func.variadic);
                    if let Some(id) = func.entity {
                        set_entity_ty(entities, id, fn_ty, func.pos, table, diag);
                    }
                }

                resolve_block(&mut func.body, entities, table, diag);
            }
            Declaration::UndefinedFunction(func) => {
                let ret = resolve_ref(&mut func.ret, table, diag);

                let mut param_tys = vec![];
                for param in &mut func.params {
                    if let Some(ty) = resolve_param(&mut param.ty, table, diag) {
                        param_tys.push(ty);
                    }
                }

                if let Some(ret) = ret {
                    let fn_ty = table.function(ret, param_tys, func.variadic);
                    if let Some(id) = func.entity {
                        set_entity_ty(entities, id, fn_ty, func.pos, table, diag);
                    }
                }
            }
            Declaration::DefinedVariable(var) => {
                resolve_var(
                    &mut var.ty,
                    var.entity,
                    var.pos,
                    entities,
                    table,
                    diag,
                );
                if let Some(init) = &mut var.init {
                    resolve_expr_types(init, table, diag);
                }
            }
            Declaration::UndefinedVariable(var) => {
                resolve_var(&mut var.ty, var.entity, var.pos, entities, table, diag);
            }
            Declaration::Constant(c) => {
                if let Some(ty) = resolve_ref(&mut c.ty, table, diag) {
                    if !table.is_integer(ty) {
                        diag.error(c.pos, "constant must have integer type");
                    } else if let Some(id) = c.entity {
                        set_entity_ty(entities, id, ty, c.pos, table, diag);
                    }
                }
                resolve_expr_types(&mut c.value, table, diag);
            }
            Declaration::StructDef(_) | Declaration::UnionDef(_) | Declaration::TypeDef(_) => {}
        }
    }
    ast.decls = decls;

    diag.checkpoint(mark, Error::Semantic)
}

fn already_resolved(ast: &Ast) -> bool {
    ast.decls.iter().any(|decl| match decl {
        Declaration::DefinedFunction(f) => f.ret.resolved.is_some(),
        Declaration::UndefinedFunction(f) => f.ret.resolved.is_some(),
        Declaration::DefinedVariable(v) => v.ty.resolved.is_some(),
        Declaration::UndefinedVariable(v) => v.ty.resolved.is_some(),
        Declaration::Constant(c) => c.ty.resolved.is_some(),
        Declaration::StructDef(d) | Declaration::UnionDef(d) => {
            d.members.iter().any(|m| m.ty.resolved.is_some())
        }
        Declaration::TypeDef(t) => t.ty.resolved.is_some(),
    })
}

/// Resolves one syntactic type reference, caching the result on the node.
fn resolve_ref(
    ty_ref: &mut TypeRef,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) -> Option<TypeId> {
    if let Some(id) = ty_ref.resolved {
        return Some(id);
    }

    let id = match &mut ty_ref.kind {
        TypeRefKind::Void => table.void(),
        TypeRefKind::Char => table.char(),
        TypeRefKind::UChar => table.uchar(),
        TypeRefKind::Short => table.short(),
        TypeRefKind::UShort => table.ushort(),
        TypeRefKind::Int => table.int(),
        TypeRefKind::UInt => table.uint(),
        TypeRefKind::Long => table.long(),
        TypeRefKind::ULong => table.ulong(),
        TypeRefKind::Named(name) => {
            let key = TypeKey::Plain(name.clone());
            match table.lookup(&key) {
                Some(id) => id,
                None => {
                    diag.error(ty_ref.pos, format!("undefined type: {name}"));
                    return None;
                }
            }
        }
        TypeRefKind::Struct(name) => {
            let key = TypeKey::Struct(name.clone());
            match table.lookup(&key) {
                Some(id) => id,
                None => {
                    diag.error(ty_ref.pos, format!("undefined type: struct {name}"));
                    return None;
                }
            }
        }
        TypeRefKind::Union(name) => {
            let key = TypeKey::Union(name.clone());
            match table.lookup(&key) {
                Some(id) => id,
                None => {
                    diag.error(ty_ref.pos, format!("undefined type: union {name}"));
                    return None;
                }
            }
        }
        TypeRefKind::Pointer(base) => {
            let base = resolve_ref(base, table, diag)?;
            table.pointer_to(base)
        }
        TypeRefKind::Array(base, len) => {
            let pos = ty_ref.pos;
            let len = *len;
            let base = resolve_ref(base, table, diag)?;
            if table.size_of(base).is_none() {
                diag.error(pos, "array of incomplete type");
                return None;
            }
            table.array_of(base, len)
        }
        TypeRefKind::Function {
            ret,
            params,
            variadic,
        } => {
            let variadic = *variadic;
            let ret = resolve_ref(ret, table, diag)?;
            let mut param_tys = vec![];
            for param in params {
                param_tys.push(resolve_ref(param, table, diag)?);
            }
            table.function(ret, param_tys, variadic)
        }
    };

    ty_ref.resolved = Some(id);
    Some(id)
}

/// Resolves a parameter type: `void` parameters are rejected and array
/// parameters decay to pointers to their element type.
fn resolve_param(
    ty_ref: &mut TypeRef,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) -> Option<TypeId> {
    let id = resolve_ref(ty_ref, table, diag)?;

    if table.is_void(id) {
        diag.error(ty_ref.pos, "parameter has void type");
        return None;
    }

    // Composite values do not fit the word-sized argument slots; pass a
    // pointer instead.
    if table.is_composite(id) {
        diag.error(ty_ref.pos, "struct/union parameter is not supported");
        return None;
    }

    if let Some(elem) = table.base_of(id).filter(|_| table.is_array(id)) {
        let decayed = table.pointer_to(elem);
        ty_ref.resolved = Some(decayed);
        return Some(decayed);
    }

    Some(id)
}

fn resolve_var(
    ty_ref: &mut TypeRef,
    entity: Option<EntityId>,
    pos: Pos,
    entities: &mut EntityArena,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) {
    let Some(id) = resolve_ref(ty_ref, table, diag) else {
        return;
    };

    if table.is_void(id) {
        diag.error(pos, "variable has incomplete type 'void'");
        return;
    }
    if table.is_function(id) {
        diag.error(pos, "variable has function type");
        return;
    }

    if let Some(entity) = entity {
        set_entity_ty(entities, entity, id, pos, table, diag);
    }
}

/// Records the entity's resolved type, diagnosing a mismatch with a prior
/// declaration of the same name.
fn set_entity_ty(
    entities: &mut EntityArena,
    id: EntityId,
    ty: TypeId,
    pos: Pos,
    table: &TypeTable,
    diag: &mut Diagnostics,
) {
    let entity = entities.get_mut(id);
    match entity.ty {
        None => entity.ty = Some(ty),
        Some(old) if table.same_type(old, ty) => {}
        Some(_) => {
            diag.error(pos, format!("conflicting declaration: {}", entity.name));
        }
    }
}

fn resolve_block(
    block: &mut Block,
    entities: &mut EntityArena,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) {
    for item in &mut block.items {
        match item {
            BlockItem::Decl(var) => resolve_local(var, entities, table, diag),
            BlockItem::Stmt(stmt) => resolve_stmt(stmt, entities, table, diag),
        }
    }
}

fn resolve_local(
    var: &mut VarDef,
    entities: &mut EntityArena,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) {
    resolve_var(&mut var.ty, var.entity, var.pos, entities, table, diag);
    if let Some(init) = &mut var.init {
        resolve_expr_types(init, table, diag);
    }
}

fn resolve_stmt(
    stmt: &mut Stmt,
    entities: &mut EntityArena,
    table: &mut TypeTable,
    diag: &mut Diagnostics,
) {
    match stmt {
        Stmt::Expr(expr) => resolve_expr_types(expr, table, diag),
        Stmt::Block(block) => resolve_block(block, entities, table, diag),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            resolve_expr_types(cond, table, diag);
            resolve_stmt(then, entities, table, diag);
            if let Some(e) = otherwise {
                resolve_stmt(e, entities, table, diag);
            }
        }
        Stmt::While { cond, body, .. } => {
            resolve_expr_types(cond, table, diag);
            resolve_stmt(body, entities, table, diag);
        }
        Stmt::DoWhile { body, cond, .. } => {
            resolve_stmt(body, entities, table, diag);
            resolve_expr_types(cond, table, diag);
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
                resolve_local(decl, entities, table, diag);
            }
            for expr in [init, cond, step].into_iter().flatten() {
                resolve_expr_types(expr, table, diag);
            }
            resolve_stmt(body, entities, table, diag);
        }
        Stmt::Switch { cond, body, .. } => {
            resolve_expr_types(cond, table, diag);
            resolve_stmt(body, entities, table, diag);
        }
        Stmt::Case { expr, stmt, .. } => {
            resolve_expr_types(expr, table, diag);
            resolve_stmt(stmt, entities, table, diag);
        }
        Stmt::Default { stmt, .. } | Stmt::Label { stmt, .. } => {
            resolve_stmt(stmt, entities, table, diag);
        }
        Stmt::Return { expr, .. } => {
            if let Some(e) = expr {
                resolve_expr_types(e, table, diag);
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Goto { .. } | Stmt::Empty => {}
    }
}

/// Resolves the type references that appear inside expressions: cast targets
/// and `sizeof(type)` operands.
fn resolve_expr_types(expr: &mut Expr, table: &mut TypeTable, diag: &mut Diagnostics) {
    match &mut expr.kind {
        ExprKind::Cast { to, expr } => {
            resolve_ref(to, table, diag);
            resolve_expr_types(expr, table, diag);
        }
        ExprKind::SizeofType(ty) => {
            resolve_ref(ty, table, diag);
        }
        ExprKind::IntLit { .. } | ExprKind::StrLit(_) | ExprKind::Var { .. } => {}
        ExprKind::Unary { expr, .. }
        | ExprKind::IncDec { expr, .. }
        | ExprKind::Deref(expr)
        | ExprKind::AddrOf(expr)
        | ExprKind::SizeofExpr(expr)
        | ExprKind::Member { expr, .. }
        | ExprKind::PtrMember { expr, .. } => resolve_expr_types(expr, table, diag),
        ExprKind::Binary { lhs, rhs, .. }
        | ExprKind::Assign { lhs, rhs }
        | ExprKind::OpAssign { lhs, rhs, .. }
        | ExprKind::Comma { lhs, rhs } => {
            resolve_expr_types(lhs, table, diag);
            resolve_expr_types(rhs, table, diag);
        }
        ExprKind::Index { expr, index } => {
            resolve_expr_types(expr, table, diag);
            resolve_expr_types(index, table, diag);
        }
        ExprKind::Call { func, args } => {
            resolve_expr_types(func, table, diag);
            for arg in args {
                resolve_expr_types(arg, table, diag);
            }
        }
        ExprKind::Cond {
            cond,
            then,
            otherwise,
        } => {
            resolve_expr_types(cond, table, diag);
            resolve_expr_types(then, table, diag);
            resolve_expr_types(otherwise, table, diag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema::symbols;

    fn resolve_src(src: &str) -> (Result<()>, Ast, TypeTable, Diagnostics) {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        symbols::resolve(&mut ast, &mut diag).expect("symbols");
        let result = resolve(&mut ast, &mut table, &mut diag);
        (result, ast, table, diag)
    }

    #[test]
    fn function_entities_get_function_types() {
        let (result, ast, table, _) =
            resolve_src("int add(int a, int b) { return a + b; } int main(void) { return add(1, 2); }");
        result.expect("resolve");

        let func = ast.defined_functions().next().expect("add");
        let entity = ast.entities.get(func.entity.expect("bound"));
        let ty = entity.ty.expect("typed");
        assert!(table.is_function(ty));
    }

    #[test]
    fn struct_members_resolve_through_table() {
        let (result, _, table, _) = resolve_src(
            "struct P { int x; int y; }; int main(void) { struct P p; p.x = 1; return 0; }",
        );
        result.expect("resolve");

        let id = table.lookup(&TypeKey::Struct("P".into())).expect("defined");
        assert_eq!(table.size_of(id), Some(8));
    }

    #[test]
    fn self_referential_struct_through_pointer() {
        let (result, _, table, _) = resolve_src(
            "struct node { int value; struct node *next; };\n\
             int main(void) { return 0; }",
        );
        result.expect("resolve");

        let id = table
            .lookup(&TypeKey::Struct("node".into()))
            .expect("defined");
        assert_eq!(table.size_of(id), Some(8));
    }

    #[test]
    fn typedef_chains_flatten() {
        let (result, _, table, _) = resolve_src(
            "typedef int myint; typedef myint myint2; int main(void) { myint2 v; v = 3; return v; }",
        );
        result.expect("resolve");

        let id = table
            .lookup(&TypeKey::Plain("myint2".into()))
            .expect("defined");
        assert_eq!(id, table.int());
    }

    #[test]
    fn array_params_decay_to_pointers() {
        let (result, ast, table, _) = resolve_src(
            "int first(int xs[4]) { return xs[0]; } int main(void) { int a[4]; a[0] = 1; return first(a); }",
        );
        result.expect("resolve");

        let func = ast.defined_functions().next().expect("first");
        let param = ast.entities.get(func.params[0].entity.expect("bound"));
        assert!(table.is_pointer(param.ty.expect("typed")));
    }

    #[test]
    fn undefined_struct_is_error() {
        let (result, _, _, diag) =
            resolve_src("int main(void) { struct nope x; return 0; }");
        assert!(result.is_err());
        assert!(diag.error_count() >= 1);
    }

    #[test]
    fn void_variable_is_error() {
        let (result, _, _, _) = resolve_src("int main(void) { void v; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn void_parameter_is_error() {
        let (result, _, _, _) =
            resolve_src("int f(void v) { return 0; } int main(void) { return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn duplicated_struct_definition_is_error() {
        let (result, _, _, _) = resolve_src(
            "struct A { int x; }; struct A { int y; }; int main(void) { return 0; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn conflicting_prototype_types_are_rejected() {
        let (result, _, _, _) = resolve_src(
            "int f(int a); int f(char *a) { return 0; } int main(void) { return 0; }",
        );
        assert!(result.is_err());
    }
}
