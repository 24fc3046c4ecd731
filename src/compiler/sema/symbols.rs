//! Reference resolution.
//!
//! Builds the lexical scope tree and binds every identifier use to its
//! declaration's entity. File scope is populated from all top-level
//! declarations first, so functions and globals may be referenced before
//! their definition; bodies then introduce a child scope per parameter list,
//! block, and `for` initializer.
//!
//! Duplicate names within one scope and unresolved references are errors;
//! shadowing across scopes is permitted. A prototype merges with its
//! definition into a single entity.

use indexmap::IndexMap;

use crate::compiler::parser::ast::{
    Ast, Block, BlockItem, Declaration, Entity, EntityArena, EntityId, EntityKind, Expr,
    ExprKind, FunctionDef, Stmt, Storage, VarDef,
};
use crate::error::{Diagnostics, Error, Pos, Result};

#[derive(Debug)]
struct ScopeData {
    parent: Option<usize>,
    bindings: IndexMap<String, EntityId>,
}

/// Scope arena plus the stack of currently active scopes.
#[derive(Debug)]
struct Resolver<'a> {
    scopes: Vec<ScopeData>,
    active: Vec<usize>,
    entities: &'a mut EntityArena,
    diag: &'a mut Diagnostics,
}

impl<'a> Resolver<'a> {
    const FILE_SCOPE: usize = 0;

    fn new(entities: &'a mut EntityArena, diag: &'a mut Diagnostics) -> Self {
        Self {
            scopes: vec![ScopeData {
                parent: None,
                bindings: IndexMap::new(),
            }],
            active: vec![Self::FILE_SCOPE],
            entities,
            diag,
        }
    }

    fn current(&self) -> usize {
        *self.active.last().expect("file scope is always active")
    }

    fn enter_scope(&mut self) {
        let parent = self.current();
        self.scopes.push(ScopeData {
            parent: Some(parent),
            bindings: IndexMap::new(),
        });
        self.active.push(self.scopes.len() - 1);
    }

    fn exit_scope(&mut self) {
        debug_assert!(self.active.len() > 1, "attempting to exit file scope");
        self.active.pop();
    }

    /// Walks the scope chain from the innermost active scope outward.
    fn lookup(&self, name: &str) -> Option<EntityId> {
        let mut scope = Some(self.current());
        while let Some(idx) = scope {
            if let Some(id) = self.scopes[idx].bindings.get(name) {
                return Some(*id);
            }
            scope = self.scopes[idx].parent;
        }
        None
    }

    /// Declares a local name in the current scope. Duplicate names within
    /// the same scope are rejected.
    fn declare_local(&mut self, name: &str, pos: Pos, entity: Entity) -> Option<EntityId> {
        let scope = self.current();
        if self.scopes[scope].bindings.contains_key(name) {
            self.diag
                .error(pos, format!("duplicated declaration: {name}"));
            return None;
        }

        let id = self.entities.add(entity);
        self.scopes[scope].bindings.insert(name.to_string(), id);
        Some(id)
    }

    /// Declares or merges a top-level name. Two definitions conflict; a
    /// prototype merges with its definition into the existing entity.
    fn declare_toplevel(&mut self, name: &str, pos: Pos, entity: Entity) -> Option<EntityId> {
        let Some(existing) = self.scopes[Self::FILE_SCOPE].bindings.get(name).copied() else {
            let id = self.entities.add(entity);
            self.scopes[Self::FILE_SCOPE]
                .bindings
                .insert(name.to_string(), id);
            return Some(id);
        };

        let prev = self.entities.get_mut(existing);

        if prev.kind != entity.kind {
            self.diag
                .error(pos, format!("conflicting declaration: {name}"));
            return None;
        }

        if prev.defined && entity.defined {
            self.diag
                .error(pos, format!("duplicated definition: {name}"));
            return None;
        }

        if entity.defined {
            prev.defined = true;
            prev.storage = entity.storage;
            prev.internal = entity.internal;
            prev.pos = entity.pos;
        }

        Some(existing)
    }
}

/// Resolves all references in the AST, filling the entity arena.
///
/// Running the resolver on an already-resolved AST is a no-op.
pub fn resolve(ast: &mut Ast, diag: &mut Diagnostics) -> Result<()> {
    if !ast.entities.is_empty() {
        return Ok(());
    }

    let mark = diag.error_count();
    let mut decls = std::mem::take(&mut ast.decls);
    let mut resolver = Resolver::new(&mut ast.entities, diag);

    // File scope first: every top-level name is visible to every body.
    for decl in &mut decls {
        declare_decl(decl, &mut resolver);
    }

    for decl in &mut decls {
        match decl {
            Declaration::DefinedFunction(func) => resolve_function(func, &mut resolver),
            Declaration::DefinedVariable(var) => {
                if let Some(init) = &mut var.init {
                    resolve_expr(init, &mut resolver);
                }
            }
            Declaration::Constant(c) => resolve_expr(&mut c.value, &mut resolver),
            _ => {}
        }
    }

    ast.decls = decls;
    diag.checkpoint(mark, Error::Semantic)
}

fn declare_decl(decl: &mut Declaration, resolver: &mut Resolver<'_>) {
    match decl {
        Declaration::DefinedFunction(func) => {
            func.entity = resolver.declare_toplevel(
                &func.name,
                func.pos,
                Entity {
                    name: func.name.clone(),
                    kind: EntityKind::Function,
                    storage: Storage::Static,
                    internal: func.is_static,
                    defined: true,
                    ty: None,
                    pos: func.pos,
                },
            );
        }
        Declaration::UndefinedFunction(func) => {
            func.entity = resolver.declare_toplevel(
                &func.name,
                func.pos,
                Entity {
                    name: func.name.clone(),
                    kind: EntityKind::Function,
                    storage: Storage::Extern,
                    internal: false,
                    defined: false,
                    ty: None,
                    pos: func.pos,
                },
            );
        }
        Declaration::DefinedVariable(var) => {
            var.entity = resolver.declare_toplevel(
                &var.name,
                var.pos,
                Entity {
                    name: var.name.clone(),
                    kind: EntityKind::Variable,
                    storage: Storage::Static,
                    internal: var.is_static,
                    defined: true,
                    ty: None,
                    pos: var.pos,
                },
            );
        }
        Declaration::UndefinedVariable(var) => {
            var.entity = resolver.declare_toplevel(
                &var.name,
                var.pos,
                Entity {
                    name: var.name.clone(),
                    kind: EntityKind::Variable,
                    storage: Storage::Extern,
                    internal: false,
                    defined: false,
                    ty: None,
                    pos: var.pos,
                },
            );
        }
        Declaration::Constant(c) => {
            c.entity = resolver.declare_toplevel(
                &c.name,
                c.pos,
                Entity {
                    name: c.name.clone(),
                    kind: EntityKind::Constant,
                    storage: Storage::Static,
                    internal: true,
                    defined: true,
                    ty: None,
                    pos: c.pos,
                },
            );
        }
        // Type namespace declarations carry no entity.
        Declaration::StructDef(_) | Declaration::UnionDef(_) | Declaration::TypeDef(_) => {}
    }
}

fn resolve_function(func: &mut FunctionDef, resolver: &mut Resolver<'_>) {
    resolver.enter_scope();

    for param in &mut func.params {
        if param.name.is_empty() {
            resolver
                .diag
                .error(param.pos, "parameter name omitted in function definition");
            continue;
        }

        param.entity = resolver.declare_local(
            &param.name.clone(),
            param.pos,
            Entity {
                name: param.name.clone(),
                kind: EntityKind::Variable,
                storage: Storage::Param,
                internal: false,
                defined: true,
                ty: None,
                pos: param.pos,
            },
        );
    }

    resolve_block(&mut func.body, resolver);

    resolver.exit_scope();
}

fn resolve_block(block: &mut Block, resolver: &mut Resolver<'_>) {
    resolver.enter_scope();
    for item in &mut block.items {
        match item {
            BlockItem::Decl(var) => resolve_local_decl(var, resolver),
            BlockItem::Stmt(stmt) => resolve_stmt(stmt, resolver),
        }
    }
    resolver.exit_scope();
}

fn resolve_local_decl(var: &mut VarDef, resolver: &mut Resolver<'_>) {
    var.entity = resolver.declare_local(
        &var.name.clone(),
        var.pos,
        Entity {
            name: var.name.clone(),
            kind: EntityKind::Variable,
            storage: if var.is_static {
                Storage::Static
            } else {
                Storage::Auto
            },
            internal: var.is_static,
            defined: true,
            ty: None,
            pos: var.pos,
        },
    );

    if let Some(init) = &mut var.init {
        resolve_expr(init, resolver);
    }
}

fn resolve_stmt(stmt: &mut Stmt, resolver: &mut Resolver<'_>) {
    match stmt {
        Stmt::Expr(expr) => resolve_expr(expr, resolver),
        Stmt::Block(block) => resolve_block(block, resolver),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            resolve_expr(cond, resolver);
            resolve_stmt(then, resolver);
            if let Some(e) = otherwise {
                resolve_stmt(e, resolver);
            }
        }
        Stmt::While { cond, body, .. } => {
            resolve_expr(cond, resolver);
            resolve_stmt(body, resolver);
        }
        Stmt::DoWhile { body, cond, .. } => {
            resolve_stmt(body, resolver);
            resolve_expr(cond, resolver);
        }
        Stmt::For {
            init,
            init_decl,
            cond,
            step,
            body,
            ..
        } => {
            // The initializer declaration lives in its own scope wrapping
            // the whole statement.
            resolver.enter_scope();
            if let Some(decl) = init_decl {
                resolve_local_decl(decl, resolver);
            }
            if let Some(e) = init {
                resolve_expr(e, resolver);
            }
            if let Some(e) = cond {
                resolve_expr(e, resolver);
            }
            if let Some(e) = step {
                resolve_expr(e, resolver);
            }
            resolve_stmt(body, resolver);
            resolver.exit_scope();
        }
        Stmt::Switch { cond, body, .. } => {
            resolve_expr(cond, resolver);
            resolve_stmt(body, resolver);
        }
        Stmt::Case { expr, stmt, .. } => {
            resolve_expr(expr, resolver);
            resolve_stmt(stmt, resolver);
        }
        Stmt::Default { stmt, .. } | Stmt::Label { stmt, .. } => resolve_stmt(stmt, resolver),
        Stmt::Return { expr, .. } => {
            if let Some(e) = expr {
                resolve_expr(e, resolver);
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Goto { .. } | Stmt::Empty => {}
    }
}

fn resolve_expr(expr: &mut Expr, resolver: &mut Resolver<'_>) {
    match &mut expr.kind {
        ExprKind::Var { name, entity } => match resolver.lookup(name) {
            Some(id) => *entity = Some(id),
            None => resolver
                .diag
                .error(expr.pos, format!("undefined reference to {name}")),
        },
        ExprKind::IntLit { .. } | ExprKind::StrLit(_) | ExprKind::SizeofType(_) => {}
        ExprKind::Unary { expr, .. }
        | ExprKind::IncDec { expr, .. }
        | ExprKind::Deref(expr)
        | ExprKind::AddrOf(expr)
        | ExprKind::SizeofExpr(expr)
        | ExprKind::Cast { expr, .. }
        | ExprKind::Member { expr, .. }
        | ExprKind::PtrMember { expr, .. } => resolve_expr(expr, resolver),
        ExprKind::Binary { lhs, rhs, .. }
        | ExprKind::Assign { lhs, rhs }
        | ExprKind::OpAssign { lhs, rhs, .. }
        | ExprKind::Comma { lhs, rhs } => {
            resolve_expr(lhs, resolver);
            resolve_expr(rhs, resolver);
        }
        ExprKind::Index { expr, index } => {
            resolve_expr(expr, resolver);
            resolve_expr(index, resolver);
        }
        ExprKind::Call { func, args } => {
            resolve_expr(func, resolver);
            for arg in args {
                resolve_expr(arg, resolver);
            }
        }
        ExprKind::Cond {
            cond,
            then,
            otherwise,
        } => {
            resolve_expr(cond, resolver);
            resolve_expr(then, resolver);
            resolve_expr(otherwise, resolver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;

    fn resolve_src(src: &str) -> (Result<()>, Ast, Diagnostics) {
        let mut ast = parse_source(src).expect("parse");
        let mut diag = Diagnostics::new();
        let result = resolve(&mut ast, &mut diag);
        (result, ast, diag)
    }

    #[test]
    fn binds_every_variable_reference() {
        let (result, ast, _) =
            resolve_src("int main(void) { int a; a = 1; return a; }");
        result.expect("resolve");

        let func = ast.defined_functions().next().expect("main");
        let BlockItem::Stmt(Stmt::Return { expr: Some(expr), .. }) = &func.body.items[2]
        else {
            panic!("expected return");
        };
        let ExprKind::Var { entity, .. } = &expr.kind else {
            panic!("expected var");
        };
        assert!(entity.is_some());
    }

    #[test]
    fn functions_resolve_before_their_definition() {
        let (result, _, _) = resolve_src(
            "int main(void) { return helper(); } int helper(void) { return 1; }",
        );
        result.expect("resolve");
    }

    #[test]
    fn prototype_merges_with_definition() {
        let (result, ast, _) = resolve_src(
            "int helper(int n); int helper(int n) { return n; } int main(void) { return helper(1); }",
        );
        result.expect("resolve");

        // The prototype and definition share one entity.
        let ids: Vec<_> = ast
            .decls
            .iter()
            .filter_map(|d| match d {
                Declaration::UndefinedFunction(f) => Some(f.entity.expect("bound")),
                Declaration::DefinedFunction(f) if f.name == "helper" => {
                    Some(f.entity.expect("bound"))
                }
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);

        assert!(ast.entities.get(ids[0]).defined);
    }

    #[test]
    fn shadowing_across_scopes_is_permitted() {
        let (result, _, _) = resolve_src(
            "int main(void) { int x; x = 1; { int x; x = 2; } return x; }",
        );
        result.expect("resolve");
    }

    #[test]
    fn for_init_declaration_gets_its_own_scope() {
        let (result, _, _) = resolve_src(
            "int main(void) { for (int i = 0; i < 3; i++) { int i; i = 9; } return 0; }",
        );
        result.expect("resolve");
    }

    #[test]
    fn duplicate_in_same_scope_is_error() {
        let (result, _, diag) =
            resolve_src("int main(void) { int a; int a; return 0; }");
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn undefined_reference_is_error() {
        let (result, _, diag) = resolve_src("int main(void) { return nope; }");
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn duplicate_definitions_conflict() {
        let (result, _, _) = resolve_src(
            "int main(void) { return 0; } int main(void) { return 1; }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn two_prototypes_are_allowed() {
        let (result, _, _) = resolve_src(
            "int f(void); int f(void); int main(void) { return f(); } int f(void) { return 0; }",
        );
        result.expect("resolve");
    }
}
