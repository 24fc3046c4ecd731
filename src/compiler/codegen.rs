//! Code Generation
//!
//! Translates the three-address IR into structured 32-bit x86 assembly
//! under the cdecl convention: every local, parameter, and temporary lives
//! in a frame slot addressed from `%ebp`, and each IR instruction expands
//! to a short sequence using `%eax` as the accumulator with `%ecx`/`%edx`
//! as scratch. Arguments are pushed right to left and the caller cleans
//! the stack.

use std::collections::HashMap;

use crate::compiler::ir::{
    self, BinaryIrOp, Instruction, MemRef, Program, UnaryIrOp, Value,
};
use crate::compiler::parser::ast::EntityId;

/// Structured assembly for one compilation unit.
#[derive(Debug)]
pub struct AsmProgram {
    pub functions: Vec<AsmFunction>,
    pub globals: Vec<ir::Global>,
    /// String pool carried through from lowering.
    pub strings: indexmap::IndexMap<Vec<u8>, String>,
}

#[derive(Debug)]
pub struct AsmFunction {
    pub label: String,
    pub is_global: bool,
    /// Bytes reserved below the saved frame pointer.
    pub frame_size: u32,
    pub instructions: Vec<Inst>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Eax,
    Ecx,
    Edx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Reg(Reg),
    /// `offset(%ebp)`.
    Stack(i32),
    /// Memory at a symbol.
    Data(String),
    /// `$symbol` address constant.
    LabelImm(String),
    /// `disp(%reg)`.
    Indirect(Reg, i32),
}

/// Condition codes for `set` and conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cc {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
}

impl Cc {
    pub fn suffix(self) -> &'static str {
        match self {
            Cc::E => "e",
            Cc::Ne => "ne",
            Cc::L => "l",
            Cc::Le => "le",
            Cc::G => "g",
            Cc::Ge => "ge",
            Cc::B => "b",
            Cc::Be => "be",
            Cc::A => "a",
            Cc::Ae => "ae",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Imul,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Sal,
    Sar,
    Shr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// Sized move; both operands printed at `size` bytes.
    Mov {
        size: u8,
        src: Operand,
        dst: Operand,
    },
    /// Sign-extending move from `from` bytes into a 32-bit destination.
    Movsx {
        from: u8,
        src: Operand,
        dst: Operand,
    },
    Movzx {
        from: u8,
        src: Operand,
        dst: Operand,
    },
    Lea {
        src: Operand,
        dst: Operand,
    },
    Neg(Operand),
    Not(Operand),
    Binary {
        op: BinOp,
        src: Operand,
        dst: Operand,
    },
    /// Shift `dst` by `%cl`.
    Shift {
        op: ShiftOp,
        dst: Operand,
    },
    /// Sign-extend `%eax` into `%edx:%eax`.
    Cltd,
    Idiv(Operand),
    Div(Operand),
    /// `cmp src, dst` (flags from `dst - src`).
    Cmp {
        src: Operand,
        dst: Operand,
    },
    /// `set<cc>` on the byte register of `dst`.
    Set {
        cc: Cc,
        dst: Operand,
    },
    Jmp(String),
    JmpCc {
        cc: Cc,
        target: String,
    },
    Push(Operand),
    Call(String),
    /// Caller stack cleanup after a call.
    AddEsp(u32),
    /// `leave; ret`.
    Ret,
    Label(String),
}

/// Frame slot assignment for one function.
struct Frame {
    offsets: HashMap<EntityId, i32>,
    tmp_offsets: Vec<i32>,
    size: u32,
}

impl Frame {
    /// Parameters sit above the saved `%ebp` and return address at
    /// `8, 12, …`; locals and temporaries grow downward, each slot aligned
    /// to its type, the total rounded up to 4.
    fn layout(func: &ir::Function) -> Frame {
        let mut offsets = HashMap::new();

        for (i, param) in func.params.iter().enumerate() {
            offsets.insert(*param, 8 + 4 * i as i32);
        }

        let mut depth: u32 = 0;
        for local in &func.locals {
            depth = (depth + local.size).next_multiple_of(local.align);
            offsets.insert(local.id, -(depth as i32));
        }

        let mut tmp_offsets = vec![];
        for _ in 0..func.tmp_count {
            depth = (depth + 4).next_multiple_of(4);
            tmp_offsets.push(-(depth as i32));
        }

        Frame {
            offsets,
            tmp_offsets,
            size: depth.next_multiple_of(4),
        }
    }

    fn operand(&self, value: &Value) -> Operand {
        match value {
            Value::Imm(v) => Operand::Imm(*v),
            Value::Local(id) => Operand::Stack(
                *self
                    .offsets
                    .get(id)
                    .expect("frame slot assigned for entity"),
            ),
            Value::Tmp(n) => Operand::Stack(self.tmp_offsets[*n as usize]),
            Value::Global(label) => Operand::Data(label.clone()),
            Value::LabelAddr(label) => Operand::LabelImm(label.clone()),
        }
    }
}

/// Generates structured assembly for a lowered program.
pub fn generate(program: Program) -> AsmProgram {
    let functions = program
        .functions
        .iter()
        .map(generate_function)
        .collect();

    AsmProgram {
        functions,
        globals: program.globals,
        strings: program.strings,
    }
}

fn generate_function(func: &ir::Function) -> AsmFunction {
    let frame = Frame::layout(func);
    let mut out = Emitter {
        frame,
        insts: vec![],
    };

    for instr in &func.instructions {
        out.select(instr);
    }

    AsmFunction {
        label: func.name.clone(),
        is_global: func.is_global,
        frame_size: out.frame.size,
        instructions: out.insts,
    }
}

struct Emitter {
    frame: Frame,
    insts: Vec<Inst>,
}

impl Emitter {
    fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Moves a value into a register.
    fn load_reg(&mut self, value: &Value, reg: Reg) {
        let src = self.frame.operand(value);
        self.push(Inst::Mov {
            size: 4,
            src,
            dst: Operand::Reg(reg),
        });
    }

    /// Stores `%eax` into a slot.
    fn store_eax(&mut self, value: &Value) {
        let dst = self.frame.operand(value);
        self.push(Inst::Mov {
            size: 4,
            src: Operand::Reg(Reg::Eax),
            dst,
        });
    }

    /// Word move between arbitrary operands, routing memory-to-memory
    /// through `%eax`.
    fn move_value(&mut self, src: &Value, dst: &Value) {
        let src_op = self.frame.operand(src);
        let dst_op = self.frame.operand(dst);

        match src_op {
            Operand::Imm(_) | Operand::LabelImm(_) => {
                self.push(Inst::Mov {
                    size: 4,
                    src: src_op,
                    dst: dst_op,
                });
            }
            _ => {
                self.push(Inst::Mov {
                    size: 4,
                    src: src_op,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.push(Inst::Mov {
                    size: 4,
                    src: Operand::Reg(Reg::Eax),
                    dst: dst_op,
                });
            }
        }
    }

    fn select(&mut self, instr: &Instruction) {
        match instr {
            Instruction::Copy { src, dst } => self.move_value(src, dst),
            Instruction::Unary { op, src, dst } => self.select_unary(*op, src, dst),
            Instruction::Binary {
                op,
                lhs,
                rhs,
                dst,
                signed,
            } => self.select_binary(*op, lhs, rhs, dst, *signed),
            Instruction::Load {
                addr,
                dst,
                size,
                signed,
            } => {
                self.load_reg(addr, Reg::Ecx);
                let mem = Operand::Indirect(Reg::Ecx, 0);
                match (size, signed) {
                    (4, _) => self.push(Inst::Mov {
                        size: 4,
                        src: mem,
                        dst: Operand::Reg(Reg::Eax),
                    }),
                    (n, true) => self.push(Inst::Movsx {
                        from: *n as u8,
                        src: mem,
                        dst: Operand::Reg(Reg::Eax),
                    }),
                    (n, false) => self.push(Inst::Movzx {
                        from: *n as u8,
                        src: mem,
                        dst: Operand::Reg(Reg::Eax),
                    }),
                }
                self.store_eax(dst);
            }
            Instruction::Store { src, addr, size } => {
                self.load_reg(addr, Reg::Ecx);
                self.load_reg(src, Reg::Eax);
                self.push(Inst::Mov {
                    size: *size as u8,
                    src: Operand::Reg(Reg::Eax),
                    dst: Operand::Indirect(Reg::Ecx, 0),
                });
            }
            Instruction::AddrOf { src, dst } => {
                match src {
                    MemRef::Local(id) => {
                        let offset = *self
                            .frame
                            .offsets
                            .get(id)
                            .expect("frame slot assigned for entity");
                        self.push(Inst::Lea {
                            src: Operand::Stack(offset),
                            dst: Operand::Reg(Reg::Eax),
                        });
                    }
                    MemRef::Global(label) => {
                        self.push(Inst::Mov {
                            size: 4,
                            src: Operand::LabelImm(label.clone()),
                            dst: Operand::Reg(Reg::Eax),
                        });
                    }
                }
                self.store_eax(dst);
            }
            Instruction::Memcpy { src, dst, size } => {
                self.load_reg(src, Reg::Eax);
                self.load_reg(dst, Reg::Ecx);

                let mut offset = 0i32;
                let mut remaining = *size;
                while remaining >= 4 {
                    self.push(Inst::Mov {
                        size: 4,
                        src: Operand::Indirect(Reg::Eax, offset),
                        dst: Operand::Reg(Reg::Edx),
                    });
                    self.push(Inst::Mov {
                        size: 4,
                        src: Operand::Reg(Reg::Edx),
                        dst: Operand::Indirect(Reg::Ecx, offset),
                    });
                    offset += 4;
                    remaining -= 4;
                }
                while remaining > 0 {
                    self.push(Inst::Mov {
                        size: 1,
                        src: Operand::Indirect(Reg::Eax, offset),
                        dst: Operand::Reg(Reg::Edx),
                    });
                    self.push(Inst::Mov {
                        size: 1,
                        src: Operand::Reg(Reg::Edx),
                        dst: Operand::Indirect(Reg::Ecx, offset),
                    });
                    offset += 1;
                    remaining -= 1;
                }
            }
            Instruction::Call { name, args, dst } => {
                // cdecl: arguments pushed right to left, caller cleans up.
                for arg in args.iter().rev() {
                    let op = self.frame.operand(arg);
                    self.push(Inst::Push(op));
                }
                self.push(Inst::Call(name.clone()));
                if !args.is_empty() {
                    self.push(Inst::AddEsp(4 * args.len() as u32));
                }
                if let Some(dst) = dst {
                    self.store_eax(dst);
                }
            }
            Instruction::Label(label) => self.push(Inst::Label(label.clone())),
            Instruction::Jump(target) => self.push(Inst::Jmp(target.clone())),
            Instruction::JumpIfZero { cond, target } => {
                self.test_against_zero(cond);
                self.push(Inst::JmpCc {
                    cc: Cc::E,
                    target: target.clone(),
                });
            }
            Instruction::JumpIfNotZero { cond, target } => {
                self.test_against_zero(cond);
                self.push(Inst::JmpCc {
                    cc: Cc::Ne,
                    target: target.clone(),
                });
            }
            Instruction::Switch {
                cond,
                cases,
                default,
            } => {
                self.load_reg(cond, Reg::Eax);
                for (value, target) in cases {
                    self.push(Inst::Cmp {
                        src: Operand::Imm(*value),
                        dst: Operand::Reg(Reg::Eax),
                    });
                    self.push(Inst::JmpCc {
                        cc: Cc::E,
                        target: target.clone(),
                    });
                }
                self.push(Inst::Jmp(default.clone()));
            }
            Instruction::Return(value) => {
                if let Some(value) = value {
                    self.load_reg(value, Reg::Eax);
                }
                self.push(Inst::Ret);
            }
        }
    }

    fn test_against_zero(&mut self, cond: &Value) {
        let op = self.frame.operand(cond);
        match op {
            // `cmp` needs a non-immediate operand to test.
            Operand::Imm(_) | Operand::LabelImm(_) => {
                self.push(Inst::Mov {
                    size: 4,
                    src: op,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.push(Inst::Cmp {
                    src: Operand::Imm(0),
                    dst: Operand::Reg(Reg::Eax),
                });
            }
            _ => self.push(Inst::Cmp {
                src: Operand::Imm(0),
                dst: op,
            }),
        }
    }

    fn select_unary(&mut self, op: UnaryIrOp, src: &Value, dst: &Value) {
        self.load_reg(src, Reg::Eax);

        match op {
            UnaryIrOp::Neg => self.push(Inst::Neg(Operand::Reg(Reg::Eax))),
            UnaryIrOp::BitNot => self.push(Inst::Not(Operand::Reg(Reg::Eax))),
            UnaryIrOp::Not => {
                self.push(Inst::Cmp {
                    src: Operand::Imm(0),
                    dst: Operand::Reg(Reg::Eax),
                });
                self.push(Inst::Set {
                    cc: Cc::E,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.push(Inst::Movzx {
                    from: 1,
                    src: Operand::Reg(Reg::Eax),
                    dst: Operand::Reg(Reg::Eax),
                });
            }
            UnaryIrOp::SignExtendByte => self.push(Inst::Movsx {
                from: 1,
                src: Operand::Reg(Reg::Eax),
                dst: Operand::Reg(Reg::Eax),
            }),
            UnaryIrOp::SignExtendWord => self.push(Inst::Movsx {
                from: 2,
                src: Operand::Reg(Reg::Eax),
                dst: Operand::Reg(Reg::Eax),
            }),
            UnaryIrOp::ZeroExtendByte => self.push(Inst::Movzx {
                from: 1,
                src: Operand::Reg(Reg::Eax),
                dst: Operand::Reg(Reg::Eax),
            }),
            UnaryIrOp::ZeroExtendWord => self.push(Inst::Movzx {
                from: 2,
                src: Operand::Reg(Reg::Eax),
                dst: Operand::Reg(Reg::Eax),
            }),
        }

        self.store_eax(dst);
    }

    fn select_binary(
        &mut self,
        op: BinaryIrOp,
        lhs: &Value,
        rhs: &Value,
        dst: &Value,
        signed: bool,
    ) {
        match op {
            BinaryIrOp::Add
            | BinaryIrOp::Sub
            | BinaryIrOp::Mul
            | BinaryIrOp::And
            | BinaryIrOp::Or
            | BinaryIrOp::Xor => {
                let asm_op = match op {
                    BinaryIrOp::Add => BinOp::Add,
                    BinaryIrOp::Sub => BinOp::Sub,
                    BinaryIrOp::Mul => BinOp::Imul,
                    BinaryIrOp::And => BinOp::And,
                    BinaryIrOp::Or => BinOp::Or,
                    _ => BinOp::Xor,
                };
                self.load_reg(lhs, Reg::Eax);
                let rhs_op = self.frame.operand(rhs);
                self.push(Inst::Binary {
                    op: asm_op,
                    src: rhs_op,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.store_eax(dst);
            }
            BinaryIrOp::Div | BinaryIrOp::Mod => {
                self.load_reg(lhs, Reg::Eax);
                self.load_reg(rhs, Reg::Ecx);
                if signed {
                    self.push(Inst::Cltd);
                    self.push(Inst::Idiv(Operand::Reg(Reg::Ecx)));
                } else {
                    self.push(Inst::Mov {
                        size: 4,
                        src: Operand::Imm(0),
                        dst: Operand::Reg(Reg::Edx),
                    });
                    self.push(Inst::Div(Operand::Reg(Reg::Ecx)));
                }
                if op == BinaryIrOp::Mod {
                    self.push(Inst::Mov {
                        size: 4,
                        src: Operand::Reg(Reg::Edx),
                        dst: Operand::Reg(Reg::Eax),
                    });
                }
                self.store_eax(dst);
            }
            BinaryIrOp::Shl | BinaryIrOp::Shr => {
                self.load_reg(lhs, Reg::Eax);
                self.load_reg(rhs, Reg::Ecx);
                let shift = match (op, signed) {
                    (BinaryIrOp::Shl, _) => ShiftOp::Sal,
                    (BinaryIrOp::Shr, true) => ShiftOp::Sar,
                    _ => ShiftOp::Shr,
                };
                self.push(Inst::Shift {
                    op: shift,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.store_eax(dst);
            }
            BinaryIrOp::Eq
            | BinaryIrOp::NotEq
            | BinaryIrOp::Lt
            | BinaryIrOp::Le
            | BinaryIrOp::Gt
            | BinaryIrOp::Ge => {
                self.load_reg(lhs, Reg::Eax);
                let rhs_op = self.frame.operand(rhs);
                self.push(Inst::Cmp {
                    src: rhs_op,
                    dst: Operand::Reg(Reg::Eax),
                });

                let cc = match (op, signed) {
                    (BinaryIrOp::Eq, _) => Cc::E,
                    (BinaryIrOp::NotEq, _) => Cc::Ne,
                    (BinaryIrOp::Lt, true) => Cc::L,
                    (BinaryIrOp::Le, true) => Cc::Le,
                    (BinaryIrOp::Gt, true) => Cc::G,
                    (BinaryIrOp::Ge, true) => Cc::Ge,
                    (BinaryIrOp::Lt, false) => Cc::B,
                    (BinaryIrOp::Le, false) => Cc::Be,
                    (BinaryIrOp::Gt, false) => Cc::A,
                    (BinaryIrOp::Ge, false) => Cc::Ae,
                    _ => unreachable!(),
                };
                self.push(Inst::Set {
                    cc,
                    dst: Operand::Reg(Reg::Eax),
                });
                self.push(Inst::Movzx {
                    from: 1,
                    src: Operand::Reg(Reg::Eax),
                    dst: Operand::Reg(Reg::Eax),
                });
                self.store_eax(dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema;
    use crate::compiler::types::TypeTable;
    use crate::error::Diagnostics;

    fn compile(src: &str) -> AsmProgram {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        sema::analyze(&mut ast, &mut table, &mut diag).expect("analyze");
        let program = ir::generate(&ast, &mut table);
        generate(program)
    }

    fn main_fn(program: &AsmProgram) -> &AsmFunction {
        program
            .functions
            .iter()
            .find(|f| f.label == "main")
            .expect("main generated")
    }

    #[test]
    fn empty_frame_for_constant_return() {
        let program = compile("int main(void) { return 0; }");
        let func = main_fn(&program);
        assert_eq!(func.frame_size, 0);
        assert_eq!(
            func.instructions,
            vec![
                Inst::Mov {
                    size: 4,
                    src: Operand::Imm(0),
                    dst: Operand::Reg(Reg::Eax)
                },
                Inst::Ret
            ]
        );
    }

    #[test]
    fn params_land_above_the_frame() {
        let program = compile(
            "int add(int a, int b) { return a + b; } int main(void) { return add(3, 4); }",
        );
        let func = program
            .functions
            .iter()
            .find(|f| f.label == "add")
            .expect("add");
        // First parameter at 8(%ebp), second at 12(%ebp).
        assert!(func.instructions.contains(&Inst::Mov {
            size: 4,
            src: Operand::Stack(8),
            dst: Operand::Reg(Reg::Eax)
        }));
        assert!(func.instructions.iter().any(|inst| matches!(
            inst,
            Inst::Binary {
                op: BinOp::Add,
                src: Operand::Stack(12),
                ..
            }
        )));
    }

    #[test]
    fn locals_are_aligned_below_the_frame() {
        let program = compile("int main(void) { char c; int n; c = 'x'; n = 2; return n; }");
        let func = main_fn(&program);
        // char at -1, int aligned down to -8; frame rounded to 4.
        assert!(func.frame_size >= 8);
        assert_eq!(func.frame_size % 4, 0);
    }

    #[test]
    fn arguments_push_right_to_left_with_cleanup() {
        let program = compile(
            "int add(int a, int b) { return a + b; } int main(void) { return add(3, 4); }",
        );
        let func = main_fn(&program);

        let pushes: Vec<&Operand> = func
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Inst::Push(op) => Some(op),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, [&Operand::Imm(4), &Operand::Imm(3)]);

        assert!(func.instructions.contains(&Inst::Call("add".into())));
        assert!(func.instructions.contains(&Inst::AddEsp(8)));
    }

    #[test]
    fn signed_division_uses_cltd_idiv() {
        let program = compile("int main(void) { int a; a = 7; return a / 2; }");
        let func = main_fn(&program);
        assert!(func.instructions.contains(&Inst::Cltd));
        assert!(func.instructions.contains(&Inst::Idiv(Operand::Reg(Reg::Ecx))));
    }

    #[test]
    fn unsigned_division_zeroes_edx() {
        let program = compile(
            "int main(void) { unsigned int a; a = 7U; return a / 2U; }",
        );
        let func = main_fn(&program);
        assert!(func.instructions.contains(&Inst::Div(Operand::Reg(Reg::Ecx))));
        assert!(!func.instructions.contains(&Inst::Cltd));
    }

    #[test]
    fn comparisons_set_then_widen() {
        let program = compile("int main(void) { int a; a = 1; return a < 2; }");
        let func = main_fn(&program);
        let pos = func
            .instructions
            .iter()
            .position(|i| matches!(i, Inst::Set { cc: Cc::L, .. }))
            .expect("setl emitted");
        assert!(matches!(
            func.instructions[pos + 1],
            Inst::Movzx { from: 1, .. }
        ));
    }

    #[test]
    fn unsigned_comparison_uses_below() {
        let program = compile(
            "int main(void) { unsigned int a; a = 1U; return a < 2U; }",
        );
        let func = main_fn(&program);
        assert!(func
            .instructions
            .iter()
            .any(|i| matches!(i, Inst::Set { cc: Cc::B, .. })));
    }

    #[test]
    fn shifts_go_through_cl() {
        let program = compile("int main(void) { int a; a = 1; return a << 3; }");
        let func = main_fn(&program);
        assert!(func.instructions.contains(&Inst::Shift {
            op: ShiftOp::Sal,
            dst: Operand::Reg(Reg::Eax)
        }));
    }

    #[test]
    fn narrow_loads_extend() {
        let program = compile("int main(void) { char c; c = 'a'; return c; }");
        let func = main_fn(&program);
        assert!(func
            .instructions
            .iter()
            .any(|i| matches!(i, Inst::Movsx { from: 1, .. })));
    }
}
