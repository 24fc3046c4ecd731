//! Abstract Syntax Tree
//!
//! Node families produced by the parser and progressively annotated by the
//! semantic passes: entity bindings, resolved types, and jump labels.

use std::fmt;

use crate::compiler::lexer::Token;
use crate::compiler::types::TypeId;
use crate::error::Pos;

/// A parsed translation unit: its declarations in source order (imports
/// merged ahead of the unit's own declarations), the token stream they were
/// parsed from, and the entity arena filled during reference resolution.
#[derive(Debug)]
pub struct Ast {
    pub decls: Vec<Declaration>,
    pub tokens: Vec<Token>,
    pub entities: EntityArena,
}

impl Ast {
    /// Returns the defined functions of the unit in declaration order.
    pub fn defined_functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.decls.iter().filter_map(|d| match d {
            Declaration::DefinedFunction(f) => Some(f),
            _ => None,
        })
    }
}

/// Index of an [`Entity`] in the arena attached to the AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub u32);

/// Storage category of a resolved declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Block-scope variable on the frame.
    Auto,
    /// Function parameter (frame slot above the saved base pointer).
    Param,
    /// Statically allocated (file-scope definitions and `static` locals).
    Static,
    /// Declared here, allocated elsewhere.
    Extern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Variable,
    Function,
    Constant,
}

/// A declaration after reference resolution: what codegen needs to place and
/// address it.
#[derive(Debug)]
pub struct Entity {
    pub name: String,
    pub kind: EntityKind,
    pub storage: Storage,
    /// `static` linkage: the symbol stays private to the unit.
    pub internal: bool,
    pub defined: bool,
    pub ty: Option<TypeId>,
    pub pos: Pos,
}

/// Arena owning every resolved entity of a unit.
#[derive(Debug, Default)]
pub struct EntityArena {
    entities: Vec<Entity>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entity: Entity) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(entity);
        id
    }

    pub fn get(&self, id: EntityId) -> &Entity {
        &self.entities[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: EntityId) -> &mut Entity {
        &mut self.entities[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| (EntityId(i as u32), e))
    }
}

/// Syntactic reference to a type, resolved to a [`TypeId`] by the type
/// resolver.
#[derive(Debug, Clone)]
pub struct TypeRef {
    pub kind: TypeRefKind,
    pub pos: Pos,
    pub resolved: Option<TypeId>,
}

impl TypeRef {
    pub fn new(kind: TypeRefKind, pos: Pos) -> Self {
        Self {
            kind,
            pos,
            resolved: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TypeRefKind {
    Void,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    /// Typedef name.
    Named(String),
    Struct(String),
    Union(String),
    Pointer(Box<TypeRef>),
    Array(Box<TypeRef>, u32),
    Function {
        ret: Box<TypeRef>,
        params: Vec<TypeRef>,
        variadic: bool,
    },
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeRefKind::Void => write!(f, "void"),
            TypeRefKind::Char => write!(f, "char"),
            TypeRefKind::UChar => write!(f, "unsigned char"),
            TypeRefKind::Short => write!(f, "short"),
            TypeRefKind::UShort => write!(f, "unsigned short"),
            TypeRefKind::Int => write!(f, "int"),
            TypeRefKind::UInt => write!(f, "unsigned int"),
            TypeRefKind::Long => write!(f, "long"),
            TypeRefKind::ULong => write!(f, "unsigned long"),
            TypeRefKind::Named(name) => write!(f, "{name}"),
            TypeRefKind::Struct(name) => write!(f, "struct {name}"),
            TypeRefKind::Union(name) => write!(f, "union {name}"),
            TypeRefKind::Pointer(base) => write!(f, "{base}*"),
            TypeRefKind::Array(base, len) => write!(f, "{base}[{len}]"),
            TypeRefKind::Function { ret, params, variadic } => {
                write!(f, "{ret}(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                if *variadic {
                    if !params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Top-level declaration families.
#[derive(Debug)]
pub enum Declaration {
    DefinedFunction(FunctionDef),
    UndefinedFunction(FunctionDecl),
    DefinedVariable(VarDef),
    UndefinedVariable(VarDecl),
    Constant(ConstDef),
    StructDef(CompositeDef),
    UnionDef(CompositeDef),
    TypeDef(TypedefDef),
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub pos: Pos,
    pub is_static: bool,
    pub ret: TypeRef,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub body: Block,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct FunctionDecl {
    pub name: String,
    pub pos: Pos,
    pub ret: TypeRef,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct Param {
    pub name: String,
    pub pos: Pos,
    pub ty: TypeRef,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct VarDef {
    pub name: String,
    pub pos: Pos,
    pub is_static: bool,
    pub ty: TypeRef,
    pub init: Option<Expr>,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct VarDecl {
    pub name: String,
    pub pos: Pos,
    pub ty: TypeRef,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct ConstDef {
    pub name: String,
    pub pos: Pos,
    pub ty: TypeRef,
    pub value: Expr,
    pub entity: Option<EntityId>,
}

#[derive(Debug)]
pub struct CompositeDef {
    pub name: String,
    pub pos: Pos,
    pub members: Vec<Member>,
}

#[derive(Debug)]
pub struct Member {
    pub name: String,
    pub pos: Pos,
    pub ty: TypeRef,
}

#[derive(Debug)]
pub struct TypedefDef {
    pub name: String,
    pub pos: Pos,
    pub ty: TypeRef,
}

/// Compound statement with its items in source order.
#[derive(Debug, Default)]
pub struct Block {
    pub items: Vec<BlockItem>,
}

#[derive(Debug)]
pub enum BlockItem {
    Decl(VarDef),
    Stmt(Stmt),
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    Block(Block),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        /// Unique loop label, assigned by the jump resolver.
        label: String,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
        label: String,
    },
    For {
        init: Option<Expr>,
        init_decl: Option<Box<VarDef>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
        label: String,
    },
    Switch {
        cond: Expr,
        body: Box<Stmt>,
        /// `(case value, jump label)` pairs collected by the jump resolver.
        cases: Vec<(i64, String)>,
        default_label: Option<String>,
        label: String,
    },
    Case {
        expr: Expr,
        stmt: Box<Stmt>,
        pos: Pos,
        label: String,
    },
    Default {
        stmt: Box<Stmt>,
        pos: Pos,
        label: String,
    },
    Return {
        expr: Option<Expr>,
        pos: Pos,
    },
    Break {
        pos: Pos,
        /// Base label of the loop/switch to escape, assigned by the jump
        /// resolver.
        label: String,
    },
    Continue {
        pos: Pos,
        label: String,
    },
    Label {
        name: String,
        stmt: Box<Stmt>,
        pos: Pos,
        /// Canonical function-qualified label.
        canonical: String,
    },
    Goto {
        name: String,
        pos: Pos,
        canonical: String,
    },
    Empty,
}

/// Expression node with the two type slots the checker fills: the type the
/// language rules determine (`orig_ty`) and the type after promotions and
/// implicit conversions (`ty`).
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
    pub orig_ty: Option<TypeId>,
    pub ty: Option<TypeId>,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Pos) -> Self {
        Self {
            kind,
            pos,
            orig_ty: None,
            ty: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit {
        value: i64,
        unsigned: bool,
        long: bool,
    },
    StrLit(Vec<u8>),
    Var {
        name: String,
        entity: Option<EntityId>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    /// Prefix or postfix `++`/`--`.
    IncDec {
        inc: bool,
        prefix: bool,
        expr: Box<Expr>,
    },
    Deref(Box<Expr>),
    AddrOf(Box<Expr>),
    SizeofExpr(Box<Expr>),
    SizeofType(TypeRef),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    OpAssign {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cast {
        to: TypeRef,
        expr: Box<Expr>,
    },
    Member {
        expr: Box<Expr>,
        name: String,
    },
    PtrMember {
        expr: Box<Expr>,
        name: String,
    },
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Comma {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }

    /// Returns `true` for the comparison operators, whose result type is
    /// `int` regardless of operand types.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
        )
    }
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AST Program")?;
        for decl in &self.decls {
            decl.fmt_with_indent(f, 1)?;
        }
        Ok(())
    }
}

impl Declaration {
    fn fmt_with_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Declaration::DefinedFunction(func) => {
                let params = func
                    .params
                    .iter()
                    .map(|p| format!("{} {}", p.ty, p.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(
                    f,
                    "{pad}DefinedFunction {:?} {} ({params}{})",
                    func.name,
                    func.ret,
                    if func.variadic { ", ..." } else { "" },
                )?;
                func.body.fmt_with_indent(f, indent + 1)
            }
            Declaration::UndefinedFunction(func) => {
                let params = func
                    .params
                    .iter()
                    .map(|p| format!("{} {}", p.ty, p.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(
                    f,
                    "{pad}UndefinedFunction {:?} {} ({params}{})",
                    func.name,
                    func.ret,
                    if func.variadic { ", ..." } else { "" },
                )
            }
            Declaration::DefinedVariable(var) => {
                write!(f, "{pad}DefinedVariable {:?} {}", var.name, var.ty)?;
                match &var.init {
                    Some(init) => writeln!(f, " = {init}"),
                    None => writeln!(f, " = uninit"),
                }
            }
            Declaration::UndefinedVariable(var) => {
                writeln!(f, "{pad}UndefinedVariable {:?} {}", var.name, var.ty)
            }
            Declaration::Constant(c) => {
                writeln!(f, "{pad}Constant {:?} {} = {}", c.name, c.ty, c.value)
            }
            Declaration::StructDef(def) => {
                writeln!(f, "{pad}StructDef {:?}", def.name)?;
                for m in &def.members {
                    writeln!(f, "{pad}  {} {}", m.ty, m.name)?;
                }
                Ok(())
            }
            Declaration::UnionDef(def) => {
                writeln!(f, "{pad}UnionDef {:?}", def.name)?;
                for m in &def.members {
                    writeln!(f, "{pad}  {} {}", m.ty, m.name)?;
                }
                Ok(())
            }
            Declaration::TypeDef(def) => {
                writeln!(f, "{pad}TypeDef {:?} = {}", def.name, def.ty)
            }
        }
    }
}

impl Block {
    fn fmt_with_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(f, "{pad}Block {{")?;
        for item in &self.items {
            match item {
                BlockItem::Decl(var) => {
                    write!(f, "{pad}  Decl {:?} {}", var.name, var.ty)?;
                    match &var.init {
                        Some(init) => writeln!(f, " = {init}")?,
                        None => writeln!(f, " = uninit")?,
                    }
                }
                BlockItem::Stmt(stmt) => stmt.fmt_with_indent(f, indent + 1)?,
            }
        }
        writeln!(f, "{pad}}}")
    }
}

impl Stmt {
    pub(crate) fn fmt_with_indent(
        &self,
        f: &mut fmt::Formatter<'_>,
        indent: usize,
    ) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Stmt::Expr(expr) => writeln!(f, "{pad}Expr: {expr}"),
            Stmt::Block(block) => block.fmt_with_indent(f, indent),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                writeln!(f, "{pad}If ({cond})")?;
                then.fmt_with_indent(f, indent + 1)?;
                if let Some(e) = otherwise {
                    writeln!(f, "{pad}Else:")?;
                    e.fmt_with_indent(f, indent + 1)?;
                }
                Ok(())
            }
            Stmt::While { cond, body, label } => {
                writeln!(f, "{pad}While <{label}> ({cond})")?;
                body.fmt_with_indent(f, indent + 1)
            }
            Stmt::DoWhile { body, cond, label } => {
                writeln!(f, "{pad}DoWhile <{label}>")?;
                body.fmt_with_indent(f, indent + 1)?;
                writeln!(f, "{pad}  while ({cond})")
            }
            Stmt::For {
                init,
                init_decl,
                cond,
                step,
                body,
                label,
            } => {
                let init_fmt = match (init, init_decl) {
                    (Some(e), _) => format!("{e}"),
                    (None, Some(d)) => format!("{} {}", d.ty, d.name),
                    (None, None) => String::new(),
                };
                let cond_fmt = cond.as_ref().map(|e| e.to_string()).unwrap_or_default();
                let step_fmt = step.as_ref().map(|e| e.to_string()).unwrap_or_default();
                writeln!(f, "{pad}For <{label}> ({init_fmt}; {cond_fmt}; {step_fmt})")?;
                body.fmt_with_indent(f, indent + 1)
            }
            Stmt::Switch { cond, body, label, .. } => {
                writeln!(f, "{pad}Switch <{label}> ({cond})")?;
                body.fmt_with_indent(f, indent + 1)
            }
            Stmt::Case { expr, stmt, .. } => {
                writeln!(f, "{pad}Case {expr}:")?;
                stmt.fmt_with_indent(f, indent + 1)
            }
            Stmt::Default { stmt, .. } => {
                writeln!(f, "{pad}Default:")?;
                stmt.fmt_with_indent(f, indent + 1)
            }
            Stmt::Return { expr, .. } => match expr {
                Some(e) => writeln!(f, "{pad}Return {e}"),
                None => writeln!(f, "{pad}Return"),
            },
            Stmt::Break { label, .. } => writeln!(f, "{pad}Break <{label}>"),
            Stmt::Continue { label, .. } => writeln!(f, "{pad}Continue <{label}>"),
            Stmt::Label { name, stmt, .. } => {
                writeln!(f, "{pad}Label {name:?}:")?;
                stmt.fmt_with_indent(f, indent + 1)
            }
            Stmt::Goto { name, .. } => writeln!(f, "{pad}Goto {name:?}"),
            Stmt::Empty => writeln!(f, "{pad}Empty \";\""),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with_indent(f, 0)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::IntLit { value, .. } => write!(f, "{value}"),
            ExprKind::StrLit(bytes) => {
                write!(f, "\"")?;
                for b in bytes {
                    write!(f, "{}", (*b as char).escape_default())?;
                }
                write!(f, "\"")
            }
            ExprKind::Var { name, .. } => write!(f, "{name}"),
            ExprKind::Unary { op, expr } => write!(f, "{}{expr}", op.as_str()),
            ExprKind::IncDec { inc, prefix, expr } => {
                let op = if *inc { "++" } else { "--" };
                if *prefix {
                    write!(f, "{op}{expr}")
                } else {
                    write!(f, "{expr}{op}")
                }
            }
            ExprKind::Deref(expr) => write!(f, "*{expr}"),
            ExprKind::AddrOf(expr) => write!(f, "&{expr}"),
            ExprKind::SizeofExpr(expr) => write!(f, "sizeof({expr})"),
            ExprKind::SizeofType(ty) => write!(f, "sizeof({ty})"),
            ExprKind::Binary { op, lhs, rhs } => {
                write!(f, "({lhs} {} {rhs})", op.as_str())
            }
            ExprKind::Assign { lhs, rhs } => write!(f, "({lhs} = {rhs})"),
            ExprKind::OpAssign { op, lhs, rhs } => {
                write!(f, "({lhs} {}= {rhs})", op.as_str())
            }
            ExprKind::Cast { to, expr } => write!(f, "(({to}) {expr})"),
            ExprKind::Member { expr, name } => write!(f, "{expr}.{name}"),
            ExprKind::PtrMember { expr, name } => write!(f, "{expr}->{name}"),
            ExprKind::Index { expr, index } => write!(f, "{expr}[{index}]"),
            ExprKind::Call { func, args } => {
                write!(f, "{func}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => write!(f, "({cond} ? {then} : {otherwise})"),
            ExprKind::Comma { lhs, rhs } => write!(f, "({lhs}, {rhs})"),
        }
    }
}
