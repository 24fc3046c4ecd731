//! Intermediate Representation
//!
//! Lowers the checked AST into a linear three-address form per function:
//! virtual operands (immediates, frame slots, temporaries, static storage),
//! explicit loads and stores for narrow and indirect accesses, and jumps for
//! all control flow. Short-circuit operators and conditionals become
//! conditional jumps around temporary assignments; pointer arithmetic is
//! scaled here with explicit multiplies.
//!
//! Code generation trusts post-semantic invariants: an untyped expression or
//! an unresolved reference at this point is a compiler bug and panics as an
//! internal error with the source position.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::compiler::parser::ast::{
    Ast, BinaryOp, Block, BlockItem, Declaration, Entity, EntityArena, EntityId, EntityKind,
    Expr, ExprKind, Stmt, Storage, UnaryOp, VarDef,
};
use crate::compiler::sema::const_eval;
use crate::compiler::types::{TypeId, TypeTable};

/// A lowered compilation unit.
#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    /// String literal pool, deduplicated by exact byte content. The label
    /// refers to the NUL-terminated bytes in `.rodata`.
    pub strings: IndexMap<Vec<u8>, String>,
}

/// Statically allocated variable.
#[derive(Debug)]
pub struct Global {
    pub label: String,
    pub size: u32,
    pub align: u32,
    /// Constant initial value; `None` or zero means zero-initialized.
    pub init: Option<i64>,
    /// Exported symbol (external linkage).
    pub is_global: bool,
}

/// Lowered function body.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub is_global: bool,
    /// Parameter entities in declaration order; each occupies one 4-byte
    /// argument slot.
    pub params: Vec<EntityId>,
    /// Frame-allocated locals in declaration order.
    pub locals: Vec<LocalSlot>,
    /// Number of 4-byte temporaries the body uses.
    pub tmp_count: u32,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalSlot {
    pub id: EntityId,
    pub size: u32,
    pub align: u32,
}

/// Virtual operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Imm(i64),
    /// Word-sized frame slot of a local or parameter entity.
    Local(EntityId),
    /// Word-sized temporary.
    Tmp(u32),
    /// Word-sized static storage, addressed by symbol.
    Global(String),
    /// Address constant of a label (string literals).
    LabelAddr(String),
}

/// Addressable storage for `AddrOf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemRef {
    Local(EntityId),
    Global(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryIrOp {
    Neg,
    BitNot,
    /// Logical not: compare against zero.
    Not,
    /// Re-normalize a 32-bit value to a narrower type.
    SignExtendByte,
    SignExtendWord,
    ZeroExtendByte,
    ZeroExtendWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryIrOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Copy {
        src: Value,
        dst: Value,
    },
    Unary {
        op: UnaryIrOp,
        src: Value,
        dst: Value,
    },
    Binary {
        op: BinaryIrOp,
        lhs: Value,
        rhs: Value,
        dst: Value,
        signed: bool,
    },
    /// `dst = *(addr)`, widening narrow values to the 32-bit register width.
    Load {
        addr: Value,
        dst: Value,
        size: u32,
        signed: bool,
    },
    /// `*(addr) = src`, truncating to `size` bytes.
    Store {
        src: Value,
        addr: Value,
        size: u32,
    },
    AddrOf {
        src: MemRef,
        dst: Value,
    },
    /// Copy `size` bytes between two addresses (struct assignment).
    Memcpy {
        src: Value,
        dst: Value,
        size: u32,
    },
    Call {
        name: String,
        args: Vec<Value>,
        dst: Option<Value>,
    },
    Label(String),
    Jump(String),
    JumpIfZero {
        cond: Value,
        target: String,
    },
    JumpIfNotZero {
        cond: Value,
        target: String,
    },
    /// Compare-and-jump dispatch for `switch`.
    Switch {
        cond: Value,
        cases: Vec<(i64, String)>,
        default: String,
    },
    Return(Option<Value>),
}

/// Lowers a checked AST into IR.
pub fn generate(ast: &Ast, table: &mut TypeTable) -> Program {
    let mut consts = HashMap::new();
    for decl in &ast.decls {
        if let Declaration::Constant(c) = decl
            && let Some(id) = c.entity
        {
            consts.insert(id, const_eval(&c.value).unwrap_or(0));
        }
    }

    let mut program = Program {
        functions: vec![],
        globals: vec![],
        strings: IndexMap::new(),
    };
    let mut static_labels: HashMap<EntityId, String> = HashMap::new();

    for decl in &ast.decls {
        match decl {
            Declaration::DefinedVariable(var) => {
                let entity = ast.entities.get(var.entity.expect("resolved variable"));
                let ty = entity.ty.expect("typed variable");
                program.globals.push(Global {
                    label: var.name.clone(),
                    size: table.size_of(ty).expect("sized variable"),
                    align: table.align_of(ty).expect("aligned variable"),
                    init: var.init.as_ref().and_then(const_eval),
                    is_global: !entity.internal,
                });
                static_labels.insert(var.entity.expect("resolved variable"), var.name.clone());
            }
            Declaration::UndefinedVariable(var) => {
                static_labels.insert(var.entity.expect("resolved variable"), var.name.clone());
            }
            _ => {}
        }
    }

    for decl in &ast.decls {
        let Declaration::DefinedFunction(func) = decl else {
            continue;
        };
        let entity = ast.entities.get(func.entity.expect("resolved function"));

        let mut lowerer = FnLowerer {
            table: &mut *table,
            entities: &ast.entities,
            consts: &consts,
            static_labels: &mut static_labels,
            globals: &mut program.globals,
            strings: &mut program.strings,
            instrs: vec![],
            locals: vec![],
            tmp_count: 0,
            label_count: 0,
            fn_name: func.name.clone(),
        };

        lowerer.lower_block(&func.body);

        // A function body falling off the end returns 0 (Cb follows the
        // C rule for main and leaves other return values unspecified).
        let ret_ty = func.ret.resolved.expect("resolved return type");
        if !matches!(lowerer.instrs.last(), Some(Instruction::Return(_))) {
            if lowerer.table.is_void(ret_ty) {
                lowerer.instrs.push(Instruction::Return(None));
            } else {
                lowerer
                    .instrs
                    .push(Instruction::Return(Some(Value::Imm(0))));
            }
        }

        program.functions.push(Function {
            name: func.name.clone(),
            is_global: !entity.internal,
            params: func
                .params
                .iter()
                .map(|p| p.entity.expect("resolved parameter"))
                .collect(),
            locals: lowerer.locals,
            tmp_count: lowerer.tmp_count,
            instructions: lowerer.instrs,
        });
    }

    program
}

/// Either a directly addressable word slot or an address to load through.
enum Place {
    Slot(Value),
    Mem { addr: Value, ty: TypeId },
}

struct FnLowerer<'a> {
    table: &'a mut TypeTable,
    entities: &'a EntityArena,
    consts: &'a HashMap<EntityId, i64>,
    static_labels: &'a mut HashMap<EntityId, String>,
    globals: &'a mut Vec<Global>,
    strings: &'a mut IndexMap<Vec<u8>, String>,
    instrs: Vec<Instruction>,
    locals: Vec<LocalSlot>,
    tmp_count: u32,
    label_count: u32,
    fn_name: String,
}

impl FnLowerer<'_> {
    fn new_tmp(&mut self) -> Value {
        let tmp = Value::Tmp(self.tmp_count);
        self.tmp_count += 1;
        tmp
    }

    /// Labels carry a `.` so they cannot collide with user identifiers.
    fn new_label(&mut self, suffix: &str) -> String {
        let label = format!("{}.L{}.{suffix}", self.fn_name, self.label_count);
        self.label_count += 1;
        label
    }

    fn emit(&mut self, instr: Instruction) {
        self.instrs.push(instr);
    }

    fn ty_of(&self, expr: &Expr) -> TypeId {
        expr.ty
            .unwrap_or_else(|| panic!("internal error at {}: expression has no type", expr.pos))
    }

    fn entity(&self, id: EntityId) -> &Entity {
        self.entities.get(id)
    }

    fn size_of(&self, ty: TypeId) -> u32 {
        self.table
            .size_of(ty)
            .expect("sized type reached code generation")
    }

    fn str_label(&mut self, bytes: &[u8]) -> String {
        if let Some(label) = self.strings.get(bytes) {
            return label.clone();
        }
        let label = format!(".LC{}", self.strings.len());
        self.strings.insert(bytes.to_vec(), label.clone());
        label
    }

    /// Is this entity's storage a single word directly addressable by name
    /// or frame slot?
    fn is_word_entity(&self, id: EntityId) -> bool {
        let entity = self.entity(id);
        let ty = entity.ty.expect("typed entity");
        self.table.is_scalar(ty) && self.size_of(ty) == 4
    }

    fn static_label(&mut self, id: EntityId) -> String {
        if let Some(label) = self.static_labels.get(&id) {
            return label.clone();
        }
        // First reference to a static local: allocate its storage.
        let entity = self.entity(id);
        let mut label = format!("{}.{}", self.fn_name, entity.name);
        let mut n = 0;
        while self.static_labels.values().any(|l| *l == label) {
            label = format!("{}.{}.{n}", self.fn_name, entity.name);
            n += 1;
        }
        self.static_labels.insert(id, label.clone());
        label
    }

    /// Address of an entity's storage, in a fresh temporary.
    fn addr_of_entity(&mut self, id: EntityId) -> Value {
        let storage = self.entity(id).storage;
        let mem = match storage {
            Storage::Auto | Storage::Param => MemRef::Local(id),
            Storage::Static | Storage::Extern => MemRef::Global(self.static_label(id)),
        };
        let dst = self.new_tmp();
        self.emit(Instruction::AddrOf {
            src: mem,
            dst: dst.clone(),
        });
        dst
    }

    // ----- statements ---------------------------------------------------

    fn lower_block(&mut self, block: &Block) {
        for item in &block.items {
            match item {
                BlockItem::Decl(var) => self.lower_local_decl(var),
                BlockItem::Stmt(stmt) => self.lower_stmt(stmt),
            }
        }
    }

    fn lower_local_decl(&mut self, var: &VarDef) {
        let id = var.entity.expect("resolved local");
        let entity = self.entity(id);
        let ty = entity.ty.expect("typed local");
        let size = self.size_of(ty);
        let align = self.table.align_of(ty).expect("aligned local");

        if entity.storage == Storage::Static {
            let label = self.static_label(id);
            self.globals.push(Global {
                label,
                size,
                align,
                init: var.init.as_ref().and_then(const_eval),
                is_global: false,
            });
            return;
        }

        self.locals.push(LocalSlot { id, size, align });

        if let Some(init) = &var.init {
            if self.table.is_composite(ty) {
                let src = self.lower_address(init);
                let dst = self.addr_of_entity(id);
                self.emit(Instruction::Memcpy { src, dst, size });
            } else {
                let value = self.lower_expr(init);
                let place = self.place_of_entity(id);
                self.write_place(place, value);
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                let _ = self.lower_expr(expr);
            }
            Stmt::Block(block) => self.lower_block(block),
            Stmt::Empty => {}
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond_val = self.lower_expr(cond);
                match otherwise {
                    None => {
                        let end = self.new_label("if.end");
                        self.emit(Instruction::JumpIfZero {
                            cond: cond_val,
                            target: end.clone(),
                        });
                        self.lower_stmt(then);
                        self.emit(Instruction::Label(end));
                    }
                    Some(otherwise) => {
                        let else_lbl = self.new_label("if.else");
                        let end = self.new_label("if.end");
                        self.emit(Instruction::JumpIfZero {
                            cond: cond_val,
                            target: else_lbl.clone(),
                        });
                        self.lower_stmt(then);
                        self.emit(Instruction::Jump(end.clone()));
                        self.emit(Instruction::Label(else_lbl));
                        self.lower_stmt(otherwise);
                        self.emit(Instruction::Label(end));
                    }
                }
            }
            Stmt::While { cond, body, label } => {
                // `continue` re-evaluates the condition.
                self.emit(Instruction::Label(format!("{label}.cont")));
                let cond_val = self.lower_expr(cond);
                self.emit(Instruction::JumpIfZero {
                    cond: cond_val,
                    target: format!("{label}.end"),
                });
                self.lower_stmt(body);
                self.emit(Instruction::Jump(format!("{label}.cont")));
                self.emit(Instruction::Label(format!("{label}.end")));
            }
            Stmt::DoWhile { body, cond, label } => {
                self.emit(Instruction::Label(format!("{label}.top")));
                self.lower_stmt(body);
                self.emit(Instruction::Label(format!("{label}.cont")));
                let cond_val = self.lower_expr(cond);
                self.emit(Instruction::JumpIfNotZero {
                    cond: cond_val,
                    target: format!("{label}.top"),
                });
                self.emit(Instruction::Label(format!("{label}.end")));
            }
            Stmt::For {
                init,
                init_decl,
                cond,
                step,
                body,
                label,
            } => {
                if let Some(decl) = init_decl {
                    self.lower_local_decl(decl);
                }
                if let Some(init) = init {
                    let _ = self.lower_expr(init);
                }
                self.emit(Instruction::Label(format!("{label}.top")));
                if let Some(cond) = cond {
                    let cond_val = self.lower_expr(cond);
                    self.emit(Instruction::JumpIfZero {
                        cond: cond_val,
                        target: format!("{label}.end"),
                    });
                }
                self.lower_stmt(body);
                self.emit(Instruction::Label(format!("{label}.cont")));
                if let Some(step) = step {
                    let _ = self.lower_expr(step);
                }
                self.emit(Instruction::Jump(format!("{label}.top")));
                self.emit(Instruction::Label(format!("{label}.end")));
            }
            Stmt::Switch {
                cond,
                body,
                cases,
                default_label,
                label,
            } => {
                let cond_val = self.lower_expr(cond);
                let end = format!("{label}.end");
                self.emit(Instruction::Switch {
                    cond: cond_val,
                    cases: cases.clone(),
                    default: default_label.clone().unwrap_or_else(|| end.clone()),
                });
                self.lower_stmt(body);
                self.emit(Instruction::Label(end));
            }
            Stmt::Case { stmt, label, .. } => {
                self.emit(Instruction::Label(label.clone()));
                self.lower_stmt(stmt);
            }
            Stmt::Default { stmt, label, .. } => {
                self.emit(Instruction::Label(label.clone()));
                self.lower_stmt(stmt);
            }
            Stmt::Break { label, .. } => {
                self.emit(Instruction::Jump(format!("{label}.end")));
            }
            Stmt::Continue { label, .. } => {
                self.emit(Instruction::Jump(format!("{label}.cont")));
            }
            Stmt::Label { stmt, canonical, .. } => {
                self.emit(Instruction::Label(canonical.clone()));
                self.lower_stmt(stmt);
            }
            Stmt::Goto { canonical, .. } => {
                self.emit(Instruction::Jump(canonical.clone()));
            }
            Stmt::Return { expr, .. } => {
                let value = expr.as_ref().map(|e| self.lower_expr(e));
                self.emit(Instruction::Return(value));
            }
        }
    }

    // ----- places -------------------------------------------------------

    fn place_of_entity(&mut self, id: EntityId) -> Place {
        let entity = self.entity(id);
        let ty = entity.ty.expect("typed entity");
        let storage = entity.storage;

        match (storage, self.is_word_entity(id)) {
            (Storage::Auto | Storage::Param, true) => Place::Slot(Value::Local(id)),
            (Storage::Static | Storage::Extern, true) => {
                let label = self.static_label(id);
                Place::Slot(Value::Global(label))
            }
            _ => {
                let addr = self.addr_of_entity(id);
                Place::Mem { addr, ty }
            }
        }
    }

    /// Lowers an lvalue expression to the place it designates.
    fn lower_place(&mut self, expr: &Expr) -> Place {
        match &expr.kind {
            ExprKind::Var { entity, .. } => {
                self.place_of_entity(entity.expect("resolved reference"))
            }
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner);
                Place::Mem {
                    addr,
                    ty: self.ty_of(expr),
                }
            }
            ExprKind::Index { .. } | ExprKind::Member { .. } | ExprKind::PtrMember { .. } => {
                let addr = self.lower_address(expr);
                Place::Mem {
                    addr,
                    ty: self.ty_of(expr),
                }
            }
            _ => panic!(
                "internal error at {}: expression is not an lvalue",
                expr.pos
            ),
        }
    }

    /// Lowers the address of an lvalue (or array/string) expression.
    fn lower_address(&mut self, expr: &Expr) -> Value {
        match &expr.kind {
            ExprKind::Var { entity, .. } => {
                let id = entity.expect("resolved reference");
                self.addr_of_entity(id)
            }
            ExprKind::StrLit(bytes) => {
                let label = self.str_label(bytes);
                Value::LabelAddr(label)
            }
            ExprKind::Deref(inner) => self.lower_expr(inner),
            ExprKind::Index { expr: base, index } => {
                let elem = self.ty_of(expr);
                let elem_size = self.size_of(elem);

                // Array bases contribute their address; pointer bases their
                // value.
                let base_ty = self.ty_of(base);
                let base_val = if self.table.is_array(base_ty) {
                    self.lower_address(base)
                } else {
                    self.lower_expr(base)
                };
                // The base address must survive side effects of the index.
                let base_val = self.copy_to_tmp(base_val);

                let index_val = self.lower_expr(index);
                let scaled = self.new_tmp();
                self.emit(Instruction::Binary {
                    op: BinaryIrOp::Mul,
                    lhs: index_val,
                    rhs: Value::Imm(elem_size as i64),
                    dst: scaled.clone(),
                    signed: true,
                });

                let addr = self.new_tmp();
                self.emit(Instruction::Binary {
                    op: BinaryIrOp::Add,
                    lhs: base_val,
                    rhs: scaled,
                    dst: addr.clone(),
                    signed: true,
                });
                addr
            }
            ExprKind::Member { expr: base, name } => {
                let base_ty = self.ty_of(base);
                let (offset, _) = self
                    .table
                    .member_of(base_ty, name)
                    .expect("checked member access");
                let base_addr = self.lower_address(base);
                self.add_offset(base_addr, offset)
            }
            ExprKind::PtrMember { expr: base, name } => {
                let base_ty = self.ty_of(base);
                let pointee = self.table.base_of(base_ty).expect("pointer base");
                let (offset, _) = self
                    .table
                    .member_of(pointee, name)
                    .expect("checked member access");
                let base_addr = self.lower_expr(base);
                self.add_offset(base_addr, offset)
            }
            // Array decay: the cast's value is the array's address.
            ExprKind::Cast { expr: inner, .. } => self.lower_address(inner),
            _ => panic!(
                "internal error at {}: expression has no address",
                expr.pos
            ),
        }
    }

    fn add_offset(&mut self, addr: Value, offset: u32) -> Value {
        if offset == 0 {
            return addr;
        }
        let dst = self.new_tmp();
        self.emit(Instruction::Binary {
            op: BinaryIrOp::Add,
            lhs: addr,
            rhs: Value::Imm(offset as i64),
            dst: dst.clone(),
            signed: true,
        });
        dst
    }

    fn read_place(&mut self, place: Place) -> Value {
        match place {
            Place::Slot(value) => value,
            Place::Mem { addr, ty } => {
                let size = self.size_of(ty);
                let signed = self.table.is_signed(ty) || self.table.is_pointer(ty);
                let dst = self.new_tmp();
                self.emit(Instruction::Load {
                    addr,
                    dst: dst.clone(),
                    size,
                    signed,
                });
                dst
            }
        }
    }

    fn write_place(&mut self, place: Place, value: Value) {
        match place {
            Place::Slot(slot) => self.emit(Instruction::Copy {
                src: value,
                dst: slot,
            }),
            Place::Mem { addr, ty } => {
                let size = self.size_of(ty);
                self.emit(Instruction::Store {
                    src: value,
                    addr,
                    size,
                });
            }
        }
    }

    // ----- expressions --------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> Value {
        match &expr.kind {
            ExprKind::IntLit { value, .. } => Value::Imm(*value),
            ExprKind::StrLit(bytes) => {
                let label = self.str_label(bytes);
                Value::LabelAddr(label)
            }
            ExprKind::Var { entity, .. } => {
                let id = entity.expect("resolved reference");
                let e = self.entity(id);

                if e.kind == EntityKind::Constant {
                    return Value::Imm(*self.consts.get(&id).expect("evaluated constant"));
                }

                let ty = e.ty.expect("typed entity");
                if self.table.is_scalar(ty) {
                    let place = self.place_of_entity(id);
                    self.read_place(place)
                } else {
                    // Arrays and structs evaluate to their address.
                    self.lower_address(expr)
                }
            }
            ExprKind::Unary { op, expr: inner } => {
                let src = self.lower_expr(inner);
                match op {
                    UnaryOp::Plus => src,
                    UnaryOp::Minus => self.unary(UnaryIrOp::Neg, src),
                    UnaryOp::BitNot => self.unary(UnaryIrOp::BitNot, src),
                    UnaryOp::Not => self.unary(UnaryIrOp::Not, src),
                }
            }
            ExprKind::IncDec { inc, prefix, expr: inner } => {
                let ty = self.ty_of(inner);
                let delta = if let Some(base) =
                    self.table.base_of(ty).filter(|_| self.table.is_pointer(ty))
                {
                    self.size_of(base) as i64
                } else {
                    1
                };

                let place = self.lower_place(inner);
                let old = match &place {
                    Place::Slot(v) => {
                        // Keep the original value for the postfix result.
                        let tmp = self.new_tmp();
                        self.emit(Instruction::Copy {
                            src: v.clone(),
                            dst: tmp.clone(),
                        });
                        tmp
                    }
                    Place::Mem { addr, ty } => {
                        let size = self.size_of(*ty);
                        let signed = self.table.is_signed(*ty) || self.table.is_pointer(*ty);
                        let dst = self.new_tmp();
                        self.emit(Instruction::Load {
                            addr: addr.clone(),
                            dst: dst.clone(),
                            size,
                            signed,
                        });
                        dst
                    }
                };

                let new = self.new_tmp();
                self.emit(Instruction::Binary {
                    op: if *inc { BinaryIrOp::Add } else { BinaryIrOp::Sub },
                    lhs: old.clone(),
                    rhs: Value::Imm(delta),
                    dst: new.clone(),
                    signed: true,
                });
                self.write_place(place, new.clone());

                if *prefix { new } else { old }
            }
            ExprKind::Deref(_)
            | ExprKind::Index { .. }
            | ExprKind::Member { .. }
            | ExprKind::PtrMember { .. } => {
                let ty = self.ty_of(expr);
                if self.table.is_scalar(ty) {
                    let place = self.lower_place(expr);
                    self.read_place(place)
                } else {
                    self.lower_address(expr)
                }
            }
            ExprKind::AddrOf(inner) => self.lower_address(inner),
            ExprKind::SizeofExpr(inner) => {
                let ty = self.ty_of(inner);
                Value::Imm(self.size_of(ty) as i64)
            }
            ExprKind::SizeofType(ty_ref) => {
                let ty = ty_ref.resolved.expect("resolved sizeof type");
                Value::Imm(self.size_of(ty) as i64)
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            ExprKind::Assign { lhs, rhs } => {
                let ty = self.ty_of(lhs);
                if self.table.is_composite(ty) {
                    let size = self.size_of(ty);
                    let dst = self.lower_address(lhs);
                    let src = self.lower_address(rhs);
                    self.emit(Instruction::Memcpy {
                        src,
                        dst: dst.clone(),
                        size,
                    });
                    dst
                } else {
                    let place = self.lower_place(lhs);
                    let value = self.lower_expr(rhs);
                    // The value may be needed as the assignment's result
                    // after the store.
                    let result = self.copy_to_tmp(value);
                    self.write_place(place, result.clone());
                    result
                }
            }
            ExprKind::OpAssign { op, lhs, rhs } => {
                let lhs_ty = self.ty_of(lhs);
                let place = self.lower_place(lhs);
                let old = match &place {
                    Place::Slot(v) => {
                        let v = v.clone();
                        self.copy_to_tmp(v)
                    }
                    Place::Mem { addr, ty } => {
                        let size = self.size_of(*ty);
                        let signed = self.table.is_signed(*ty) || self.table.is_pointer(*ty);
                        let dst = self.new_tmp();
                        self.emit(Instruction::Load {
                            addr: addr.clone(),
                            dst: dst.clone(),
                            size,
                            signed,
                        });
                        dst
                    }
                };

                let mut rhs_val = self.lower_expr(rhs);
                if let Some(base) = self
                    .table
                    .base_of(lhs_ty)
                    .filter(|_| self.table.is_pointer(lhs_ty))
                {
                    let size = self.size_of(base);
                    rhs_val = self.binary(BinaryIrOp::Mul, rhs_val, Value::Imm(size as i64), true);
                }

                let signed = self.table.is_signed(lhs_ty);
                let result = self.binary(ir_binop(*op), old, rhs_val, signed);
                self.write_place(place, result.clone());
                result
            }
            ExprKind::Cast { expr: inner, to } => {
                let to_ty = to.resolved.expect("resolved cast target");
                let from_ty = self.ty_of(inner);

                // Array decay: the pointer value is the array's address.
                if self.table.is_array(from_ty) {
                    return self.lower_address(inner);
                }

                let value = self.lower_expr(inner);

                // Values are held widened to 32 bits; only narrowing
                // requires re-normalization.
                let to_size = self.table.size_of(to_ty).unwrap_or(4);
                if to_size >= 4 {
                    return value;
                }

                let op = match (to_size, self.table.is_signed(to_ty)) {
                    (1, true) => UnaryIrOp::SignExtendByte,
                    (1, false) => UnaryIrOp::ZeroExtendByte,
                    (2, true) => UnaryIrOp::SignExtendWord,
                    (_, _) => UnaryIrOp::ZeroExtendWord,
                };
                self.unary(op, value)
            }
            ExprKind::Call { func, args } => {
                let ExprKind::Var { entity, .. } = &func.kind else {
                    panic!(
                        "internal error at {}: call target is not a function name",
                        func.pos
                    );
                };
                let callee = self.entity(entity.expect("resolved callee"));
                let name = callee.name.clone();

                // Arguments evaluate left to right; each lands in a
                // temporary so later argument side effects cannot clobber
                // it.
                let mut arg_vals = vec![];
                for arg in args {
                    let value = self.lower_expr(arg);
                    arg_vals.push(self.copy_to_tmp(value));
                }

                let ret_ty = self.ty_of(expr);
                let dst = if self.table.is_void(ret_ty) {
                    None
                } else {
                    Some(self.new_tmp())
                };

                self.emit(Instruction::Call {
                    name,
                    args: arg_vals,
                    dst: dst.clone(),
                });

                dst.unwrap_or(Value::Imm(0))
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                let else_lbl = self.new_label("cond.else");
                let end = self.new_label("cond.end");
                let result = self.new_tmp();

                let cond_val = self.lower_expr(cond);
                self.emit(Instruction::JumpIfZero {
                    cond: cond_val,
                    target: else_lbl.clone(),
                });

                let then_val = self.lower_expr(then);
                self.emit(Instruction::Copy {
                    src: then_val,
                    dst: result.clone(),
                });
                self.emit(Instruction::Jump(end.clone()));

                self.emit(Instruction::Label(else_lbl));
                let else_val = self.lower_expr(otherwise);
                self.emit(Instruction::Copy {
                    src: else_val,
                    dst: result.clone(),
                });

                self.emit(Instruction::Label(end));
                result
            }
            ExprKind::Comma { lhs, rhs } => {
                let _ = self.lower_expr(lhs);
                self.lower_expr(rhs)
            }
        }
    }

    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Value {
        match op {
            BinaryOp::LogAnd => {
                let false_lbl = self.new_label("and.false");
                let end = self.new_label("and.end");
                let result = self.new_tmp();

                let lhs_val = self.lower_expr(lhs);
                self.emit(Instruction::JumpIfZero {
                    cond: lhs_val,
                    target: false_lbl.clone(),
                });
                let rhs_val = self.lower_expr(rhs);
                self.emit(Instruction::JumpIfZero {
                    cond: rhs_val,
                    target: false_lbl.clone(),
                });
                self.emit(Instruction::Copy {
                    src: Value::Imm(1),
                    dst: result.clone(),
                });
                self.emit(Instruction::Jump(end.clone()));
                self.emit(Instruction::Label(false_lbl));
                self.emit(Instruction::Copy {
                    src: Value::Imm(0),
                    dst: result.clone(),
                });
                self.emit(Instruction::Label(end));
                result
            }
            BinaryOp::LogOr => {
                let true_lbl = self.new_label("or.true");
                let end = self.new_label("or.end");
                let result = self.new_tmp();

                let lhs_val = self.lower_expr(lhs);
                self.emit(Instruction::JumpIfNotZero {
                    cond: lhs_val,
                    target: true_lbl.clone(),
                });
                let rhs_val = self.lower_expr(rhs);
                self.emit(Instruction::JumpIfNotZero {
                    cond: rhs_val,
                    target: true_lbl.clone(),
                });
                self.emit(Instruction::Copy {
                    src: Value::Imm(0),
                    dst: result.clone(),
                });
                self.emit(Instruction::Jump(end.clone()));
                self.emit(Instruction::Label(true_lbl));
                self.emit(Instruction::Copy {
                    src: Value::Imm(1),
                    dst: result.clone(),
                });
                self.emit(Instruction::Label(end));
                result
            }
            _ => {
                let lhs_ty = self.ty_of(lhs);
                let rhs_ty = self.ty_of(rhs);
                let lhs_ptr = self.table.is_pointer(lhs_ty) || self.table.is_array(lhs_ty);
                let rhs_ptr = self.table.is_pointer(rhs_ty) || self.table.is_array(rhs_ty);

                // The left value must survive side effects of the right
                // operand.
                let lhs_val = self.lower_expr(lhs);
                let mut lhs_val = self.copy_to_tmp(lhs_val);
                let mut rhs_val = self.lower_expr(rhs);

                // Pointer arithmetic scales the integer operand by the
                // element size; pointer difference divides back down.
                if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
                    if lhs_ptr && !rhs_ptr {
                        let size = self.elem_size(lhs_ty);
                        rhs_val =
                            self.binary(BinaryIrOp::Mul, rhs_val, Value::Imm(size as i64), true);
                    } else if rhs_ptr && !lhs_ptr {
                        let size = self.elem_size(rhs_ty);
                        lhs_val =
                            self.binary(BinaryIrOp::Mul, lhs_val, Value::Imm(size as i64), true);
                    } else if lhs_ptr && rhs_ptr && op == BinaryOp::Sub {
                        let size = self.elem_size(lhs_ty);
                        let diff = self.binary(BinaryIrOp::Sub, lhs_val, rhs_val, true);
                        return self.binary(
                            BinaryIrOp::Div,
                            diff,
                            Value::Imm(size as i64),
                            true,
                        );
                    }
                }

                let signed = if lhs_ptr || rhs_ptr {
                    // Pointer comparisons are unsigned.
                    !op.is_comparison()
                } else {
                    self.table.is_signed(lhs_ty)
                };

                self.binary(ir_binop(op), lhs_val, rhs_val, signed)
            }
        }
    }

    fn elem_size(&self, ptr_ty: TypeId) -> u32 {
        let base = self.table.base_of(ptr_ty).expect("pointer element");
        self.size_of(base)
    }

    fn unary(&mut self, op: UnaryIrOp, src: Value) -> Value {
        let dst = self.new_tmp();
        self.emit(Instruction::Unary {
            op,
            src,
            dst: dst.clone(),
        });
        dst
    }

    fn binary(&mut self, op: BinaryIrOp, lhs: Value, rhs: Value, signed: bool) -> Value {
        let dst = self.new_tmp();
        self.emit(Instruction::Binary {
            op,
            lhs,
            rhs,
            dst: dst.clone(),
            signed,
        });
        dst
    }

    /// Copies a value into a fresh temporary unless it is already immune to
    /// later side effects.
    fn copy_to_tmp(&mut self, value: Value) -> Value {
        match value {
            Value::Imm(_) | Value::Tmp(_) | Value::LabelAddr(_) => value,
            _ => {
                let tmp = self.new_tmp();
                self.emit(Instruction::Copy {
                    src: value,
                    dst: tmp.clone(),
                });
                tmp
            }
        }
    }
}

fn ir_binop(op: BinaryOp) -> BinaryIrOp {
    match op {
        BinaryOp::Add => BinaryIrOp::Add,
        BinaryOp::Sub => BinaryIrOp::Sub,
        BinaryOp::Mul => BinaryIrOp::Mul,
        BinaryOp::Div => BinaryIrOp::Div,
        BinaryOp::Mod => BinaryIrOp::Mod,
        BinaryOp::BitAnd => BinaryIrOp::And,
        BinaryOp::BitOr => BinaryIrOp::Or,
        BinaryOp::BitXor => BinaryIrOp::Xor,
        BinaryOp::Shl => BinaryIrOp::Shl,
        BinaryOp::Shr => BinaryIrOp::Shr,
        BinaryOp::Eq => BinaryIrOp::Eq,
        BinaryOp::NotEq => BinaryIrOp::NotEq,
        BinaryOp::Lt => BinaryIrOp::Lt,
        BinaryOp::Le => BinaryIrOp::Le,
        BinaryOp::Gt => BinaryIrOp::Gt,
        BinaryOp::Ge => BinaryIrOp::Ge,
        BinaryOp::LogAnd | BinaryOp::LogOr => {
            unreachable!("short-circuit operators lower to jumps")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema;
    use crate::error::Diagnostics;

    fn lower(src: &str) -> (Program, TypeTable) {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        sema::analyze(&mut ast, &mut table, &mut diag).expect("analyze");
        let program = generate(&ast, &mut table);
        (program, table)
    }

    fn main_fn(program: &Program) -> &Function {
        program
            .functions
            .iter()
            .find(|f| f.name == "main")
            .expect("main lowered")
    }

    #[test]
    fn constant_return_lowers_to_imm() {
        let (program, _) = lower("int main(void) { return 0; }");
        let func = main_fn(&program);
        assert_eq!(
            func.instructions.last(),
            Some(&Instruction::Return(Some(Value::Imm(0))))
        );
    }

    #[test]
    fn falling_off_the_end_returns_zero() {
        let (program, _) = lower("int main(void) { int x; x = 1; }");
        let func = main_fn(&program);
        assert_eq!(
            func.instructions.last(),
            Some(&Instruction::Return(Some(Value::Imm(0))))
        );
    }

    #[test]
    fn array_index_scales_by_element_size() {
        let (program, _) = lower("int main(void) { int a[3]; a[2] = 5; return a[2]; }");
        let func = main_fn(&program);
        assert!(func.instructions.iter().any(|instr| matches!(
            instr,
            Instruction::Binary {
                op: BinaryIrOp::Mul,
                rhs: Value::Imm(4),
                ..
            }
        )));
        assert!(
            func.instructions
                .iter()
                .any(|instr| matches!(instr, Instruction::Store { size: 4, .. }))
        );
    }

    #[test]
    fn pointer_difference_divides_by_element_size() {
        let (program, _) = lower(
            "int main(void) { int a[4]; int *p; int *q; p = a; q = a; return p - q; }",
        );
        let func = main_fn(&program);
        assert!(func.instructions.iter().any(|instr| matches!(
            instr,
            Instruction::Binary {
                op: BinaryIrOp::Div,
                rhs: Value::Imm(4),
                ..
            }
        )));
    }

    #[test]
    fn logical_and_short_circuits() {
        let (program, _) = lower("int f(void) { return 1; } int main(void) { return f() && f(); }");
        let func = main_fn(&program);
        let jz_count = func
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::JumpIfZero { .. }))
            .count();
        assert_eq!(jz_count, 2);
    }

    #[test]
    fn call_arguments_are_temporaries_in_order() {
        let (program, _) = lower(
            "int add(int a, int b) { return a + b; } int main(void) { return add(1, 2); }",
        );
        let func = main_fn(&program);
        let call = func
            .instructions
            .iter()
            .find_map(|i| match i {
                Instruction::Call { name, args, .. } if name == "add" => Some(args.clone()),
                _ => None,
            })
            .expect("call instruction");
        assert_eq!(call, vec![Value::Imm(1), Value::Imm(2)]);
    }

    #[test]
    fn switch_lowers_to_dispatch() {
        let (program, _) = lower(
            "int main(void) { switch (2) { case 1: return 1; case 2: return 2; default: return 0; } }",
        );
        let func = main_fn(&program);
        assert!(func.instructions.iter().any(|instr| matches!(
            instr,
            Instruction::Switch { cases, .. } if cases.len() == 2
        )));
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let (program, _) = lower(
            "extern int puts(char *s);\n\
             int main(void) { puts(\"hi\"); puts(\"hi\"); puts(\"there\"); return 0; }",
        );
        assert_eq!(program.strings.len(), 2);
    }

    #[test]
    fn globals_split_initialized_and_zero() {
        let (program, _) = lower(
            "int counter = 3; int zeroed; static int hidden = 1; int main(void) { return counter + zeroed + hidden; }",
        );

        let counter = program
            .globals
            .iter()
            .find(|g| g.label == "counter")
            .expect("counter");
        assert_eq!(counter.init, Some(3));
        assert!(counter.is_global);

        let zeroed = program
            .globals
            .iter()
            .find(|g| g.label == "zeroed")
            .expect("zeroed");
        assert_eq!(zeroed.init, None);

        let hidden = program
            .globals
            .iter()
            .find(|g| g.label == "hidden")
            .expect("hidden");
        assert!(!hidden.is_global);
    }

    #[test]
    fn struct_member_store_uses_offset() {
        let (program, _) = lower(
            "struct P { int x; int y; }; int main(void) { struct P p; p.y = 4; return p.y; }",
        );
        let func = main_fn(&program);
        // Offset of y is 4; the address computation adds it.
        assert!(func.instructions.iter().any(|instr| matches!(
            instr,
            Instruction::Binary {
                op: BinaryIrOp::Add,
                rhs: Value::Imm(4),
                ..
            }
        )));
    }

    #[test]
    fn constants_are_inlined() {
        let (program, _) = lower("const int LIMIT = 10; int main(void) { return LIMIT; }");
        let func = main_fn(&program);
        assert_eq!(
            func.instructions.last(),
            Some(&Instruction::Return(Some(Value::Imm(10))))
        );
        assert!(program.globals.is_empty());
    }
}
