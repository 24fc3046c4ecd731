//! Code Emission
//!
//! Prints the structured assembly as GNU-assembler (AT&T) text for 32-bit
//! x86. Sections: `.text` for code, `.data` for initialized globals,
//! `.bss` for zero-initialized ones, `.rodata` for string literals.
//! External-linkage symbols are exported with `.globl`; jump labels use the
//! `.L` local prefix. Under `-fpic`, calls to symbols outside the unit go
//! through the PLT.

use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::compiler::codegen::{
    AsmFunction, AsmProgram, BinOp, Inst, Operand, Reg, ShiftOp,
};

/// Emits the unit as textual assembly.
pub fn emit_gas_ia32<W: Write>(
    src_path: &Path,
    program: &AsmProgram,
    pic: bool,
    writer: W,
) -> io::Result<()> {
    let mut out = BufWriter::new(writer);

    writeln!(out, "\t.file\t\"{}\"", src_path.display())?;

    // Symbols defined in this unit are called directly even under PIC.
    let locals: HashSet<&str> = program
        .functions
        .iter()
        .map(|f| f.label.as_str())
        .collect();

    writeln!(out, "\t.text")?;
    for func in &program.functions {
        emit_function(func, &locals, pic, &mut out)?;
    }

    let mut curr_section = ".text";
    for global in &program.globals {
        let init = global.init.unwrap_or(0);

        if init == 0 {
            if global.is_global {
                if curr_section != ".bss" {
                    writeln!(out, "\t.bss")?;
                    curr_section = ".bss";
                }
                writeln!(
                    out,
                    "\t.globl\t{label}\n\t.align\t{align}\n\t.type\t{label}, @object\n\t.size\t{label}, {size}\n{label}:\n\t.zero\t{size}",
                    label = global.label,
                    align = global.align,
                    size = global.size,
                )?;
            } else {
                // Zero-initialized internal symbol as a common local; the
                // linker places it in `.bss`.
                writeln!(
                    out,
                    "\t.local\t{label}\n\t.comm\t{label},{size},{align}",
                    label = global.label,
                    size = global.size,
                    align = global.align,
                )?;
            }
        } else {
            if curr_section != ".data" {
                writeln!(out, "\t.data")?;
                curr_section = ".data";
            }
            if global.is_global {
                writeln!(out, "\t.globl\t{}", global.label)?;
            }
            let directive = match global.size {
                1 => ".byte",
                2 => ".value",
                _ => ".long",
            };
            writeln!(
                out,
                "\t.align\t{align}\n\t.type\t{label}, @object\n\t.size\t{label}, {size}\n{label}:\n\t{directive}\t{init}",
                label = global.label,
                align = global.align,
                size = global.size,
            )?;
        }
    }

    if !program.strings.is_empty() {
        writeln!(out, "\t.section\t.rodata")?;
        for (bytes, label) in &program.strings {
            writeln!(out, "{label}:\n\t.string\t\"{}\"", escape_string(bytes))?;
        }
    }

    writeln!(
        out,
        "\t.ident\t\"cbc: {}\"\n\t.section\t.note.GNU-stack,\"\",@progbits",
        env!("CARGO_PKG_VERSION")
    )?;

    out.flush()
}

fn emit_function(
    func: &AsmFunction,
    locals: &HashSet<&str>,
    pic: bool,
    out: &mut impl Write,
) -> io::Result<()> {
    if func.is_global {
        writeln!(out, "\t.globl\t{}", func.label)?;
    }
    writeln!(out, "\t.type\t{label}, @function\n{label}:", label = func.label)?;

    // Prologue: save the caller's frame, establish ours, reserve locals.
    writeln!(out, "\tpushl\t%ebp\n\tmovl\t%esp, %ebp")?;
    if func.frame_size > 0 {
        writeln!(out, "\tsubl\t${}, %esp", func.frame_size)?;
    }

    for inst in &func.instructions {
        if let Inst::Label(label) = inst {
            writeln!(out, ".L{label}:")?;
            continue;
        }
        writeln!(out, "\t{}", format_inst(inst, locals, pic))?;
    }

    writeln!(out, "\t.size\t{label}, .-{label}", label = func.label)
}

fn format_inst(inst: &Inst, locals: &HashSet<&str>, pic: bool) -> String {
    match inst {
        Inst::Mov { size, src, dst } => {
            let suffix = size_suffix(*size);
            format!(
                "mov{suffix}\t{}, {}",
                operand(src, *size),
                operand(dst, *size)
            )
        }
        Inst::Movsx { from, src, dst } => {
            let mnemonic = if *from == 1 { "movsbl" } else { "movswl" };
            format!("{mnemonic}\t{}, {}", operand(src, *from), operand(dst, 4))
        }
        Inst::Movzx { from, src, dst } => {
            let mnemonic = if *from == 1 { "movzbl" } else { "movzwl" };
            format!("{mnemonic}\t{}, {}", operand(src, *from), operand(dst, 4))
        }
        Inst::Lea { src, dst } => {
            format!("leal\t{}, {}", operand(src, 4), operand(dst, 4))
        }
        Inst::Neg(op) => format!("negl\t{}", operand(op, 4)),
        Inst::Not(op) => format!("notl\t{}", operand(op, 4)),
        Inst::Binary { op, src, dst } => {
            let mnemonic = match op {
                BinOp::Add => "addl",
                BinOp::Sub => "subl",
                BinOp::Imul => "imull",
                BinOp::And => "andl",
                BinOp::Or => "orl",
                BinOp::Xor => "xorl",
            };
            format!("{mnemonic}\t{}, {}", operand(src, 4), operand(dst, 4))
        }
        Inst::Shift { op, dst } => {
            let mnemonic = match op {
                ShiftOp::Sal => "sall",
                ShiftOp::Sar => "sarl",
                ShiftOp::Shr => "shrl",
            };
            format!("{mnemonic}\t%cl, {}", operand(dst, 4))
        }
        Inst::Cltd => "cltd".into(),
        Inst::Idiv(op) => format!("idivl\t{}", operand(op, 4)),
        Inst::Div(op) => format!("divl\t{}", operand(op, 4)),
        Inst::Cmp { src, dst } => {
            format!("cmpl\t{}, {}", operand(src, 4), operand(dst, 4))
        }
        Inst::Set { cc, dst } => format!("set{}\t{}", cc.suffix(), operand(dst, 1)),
        Inst::Jmp(target) => format!("jmp\t.L{target}"),
        Inst::JmpCc { cc, target } => format!("j{}\t.L{target}", cc.suffix()),
        Inst::Push(op) => format!("pushl\t{}", operand(op, 4)),
        Inst::Call(name) => {
            if pic && !locals.contains(name.as_str()) {
                format!("call\t{name}@PLT")
            } else {
                format!("call\t{name}")
            }
        }
        Inst::AddEsp(n) => format!("addl\t${n}, %esp"),
        Inst::Ret => "leave\n\tret".into(),
        Inst::Label(_) => unreachable!("labels are emitted without indentation"),
    }
}

fn size_suffix(size: u8) -> &'static str {
    match size {
        1 => "b",
        2 => "w",
        _ => "l",
    }
}

fn operand(op: &Operand, size: u8) -> String {
    match op {
        // Immediates carry 32-bit wraparound semantics.
        Operand::Imm(v) => format!("${}", *v as i32),
        Operand::Reg(r) => reg_name(*r, size).into(),
        Operand::Stack(offset) => format!("{offset}(%ebp)"),
        Operand::Data(label) => label.clone(),
        Operand::LabelImm(label) => format!("${label}"),
        Operand::Indirect(reg, 0) => format!("({})", reg_name(*reg, 4)),
        Operand::Indirect(reg, disp) => format!("{disp}({})", reg_name(*reg, 4)),
    }
}

fn reg_name(reg: Reg, size: u8) -> &'static str {
    match (reg, size) {
        (Reg::Eax, 1) => "%al",
        (Reg::Eax, 2) => "%ax",
        (Reg::Eax, _) => "%eax",
        (Reg::Ecx, 1) => "%cl",
        (Reg::Ecx, 2) => "%cx",
        (Reg::Ecx, _) => "%ecx",
        (Reg::Edx, 1) => "%dl",
        (Reg::Edx, 2) => "%dx",
        (Reg::Edx, _) => "%edx",
    }
}

/// Escapes string bytes for a `.string` directive; the assembler appends
/// the terminating NUL.
fn escape_string(bytes: &[u8]) -> String {
    let mut escaped = String::new();
    for &b in bytes {
        match b {
            b'"' => escaped.push_str("\\\""),
            b'\\' => escaped.push_str("\\\\"),
            b'\n' => escaped.push_str("\\n"),
            b'\t' => escaped.push_str("\\t"),
            0x20..=0x7e => escaped.push(b as char),
            _ => escaped.push_str(&format!("\\{:03o}", b)),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::tests::parse_source;
    use crate::compiler::sema;
    use crate::compiler::types::TypeTable;
    use crate::compiler::{codegen, ir};
    use crate::error::Diagnostics;

    fn assemble(src: &str) -> String {
        assemble_pic(src, false)
    }

    fn assemble_pic(src: &str, pic: bool) -> String {
        let mut ast = parse_source(src).expect("parse");
        let mut table = TypeTable::ilp32();
        let mut diag = Diagnostics::new();
        sema::analyze(&mut ast, &mut table, &mut diag).expect("analyze");
        let program = codegen::generate(ir::generate(&ast, &mut table));

        let mut buf = vec![];
        emit_gas_ia32(Path::new("test.cb"), &program, pic, &mut buf).expect("emit");
        String::from_utf8(buf).expect("assembly is UTF-8")
    }

    #[test]
    fn minimal_program_shape() {
        let asm = assemble("int main(void) { return 0; }");
        assert!(asm.contains("\t.globl\tmain"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("\tpushl\t%ebp"));
        assert!(asm.contains("\tmovl\t%esp, %ebp"));
        assert!(asm.contains("\tmovl\t$0, %eax"));
        assert!(asm.contains("\tleave\n\tret"));
        assert!(asm.contains(".note.GNU-stack"));
    }

    #[test]
    fn precedence_scenario_computes_seven() {
        // `1+2*3` folds through the accumulator; the multiply happens
        // before the add.
        let asm = assemble("int main(void) { return 1+2*3; }");
        let mul = asm.find("imull").expect("multiply emitted");
        let add = asm.find("addl").expect("add emitted");
        assert!(mul < add);
    }

    #[test]
    fn recursion_scenario_emits_call_cycle() {
        let asm = assemble(
            "int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); }\n\
             int main(void) { return fact(5); }",
        );
        assert!(asm.contains("fact:"));
        assert!(asm.contains("\tcall\tfact"));
        assert!(asm.contains("\tpushl\t$5"));
        assert!(asm.contains("\taddl\t$4, %esp"));
    }

    #[test]
    fn array_scenario_scales_indices() {
        let asm = assemble(
            "int main(void) { int a[3]; a[0]=10; a[1]=20; a[2]=30; return a[0]+a[1]+a[2]; }",
        );
        assert!(asm.contains("imull"));
        assert!(asm.contains("leal"));
    }

    #[test]
    fn struct_scenario_uses_member_offsets() {
        let asm = assemble(
            "struct P { int x; int y; };\n\
             int main(void) { struct P p; p.x=3; p.y=4; return p.x*p.x + p.y*p.y; }",
        );
        // The y member sits at offset 4; its address is computed with an
        // explicit add.
        assert!(asm.contains("addl\t$4, %eax"));
    }

    #[test]
    fn globals_are_sectioned() {
        let asm = assemble(
            "int counter = 3; int zeroed; static int hidden;\n\
             int main(void) { return counter + zeroed + hidden; }",
        );
        assert!(asm.contains("\t.data"));
        assert!(asm.contains("counter:\n\t.long\t3"));
        assert!(asm.contains("\t.bss"));
        assert!(asm.contains("zeroed:\n\t.zero\t4"));
        assert!(asm.contains("\t.local\thidden"));
        assert!(asm.contains("\t.comm\thidden,4,4"));
        // Internal linkage symbols are not exported.
        assert!(!asm.contains(".globl\thidden"));
    }

    #[test]
    fn strings_land_in_rodata() {
        let asm = assemble(
            "extern int puts(char *s);\n\
             int main(void) { puts(\"hi\\n\"); return 0; }",
        );
        assert!(asm.contains("\t.section\t.rodata"));
        assert!(asm.contains(".LC0:\n\t.string\t\"hi\\n\""));
        assert!(asm.contains("\tpushl\t$.LC0"));
    }

    #[test]
    fn plt_only_under_pic() {
        let src = "extern int puts(char *s);\n\
                   int f(void) { return 0; }\n\
                   int main(void) { puts(\"x\"); return f(); }";

        let plain = assemble_pic(src, false);
        assert!(plain.contains("\tcall\tputs\n"));

        let pic = assemble_pic(src, true);
        assert!(pic.contains("\tcall\tputs@PLT"));
        // Unit-local calls stay direct.
        assert!(pic.contains("\tcall\tf\n"));
    }

    #[test]
    fn jump_labels_use_local_prefix() {
        let asm = assemble(
            "int main(void) { int i; i = 0; while (i < 3) i++; return i; }",
        );
        assert!(asm.contains(".Lmain.loop.0.cont:"));
        assert!(asm.contains("\tjmp\t.Lmain.loop.0.cont"));
        assert!(asm.contains(".Lmain.loop.0.end:"));
    }
}
