//! Compiler driver.
//!
//! Orchestrates the per-file pipeline for every driver mode, writes the
//! assembly artifact, and shells out to the system assembler and linker.
//! Files are processed in command-line order and independently: one file's
//! failure does not stop the others, but linking only happens when every
//! file produced an object.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::{fs, io};

use log::debug;

use crate::args::{Args, Mode};
use crate::compiler::parser::ast::{Ast, BlockItem, Stmt};
use crate::compiler::parser::{self, Importer};
use crate::compiler::types::TypeTable;
use crate::compiler::{codegen, emit, ir, lexer, sema};
use crate::error::{Diagnostics, Error, Result};

/// Runs the driver, returning the process exit code.
pub fn run(args: &Args) -> i32 {
    let mode = args.mode();
    let mut diag = Diagnostics::new();

    if args.output.is_some()
        && args.files.len() > 1
        && matches!(mode, Mode::Assembly | Mode::Object)
    {
        report(&Error::Option(
            "cannot specify -o with multiple input files and -S/-c".into(),
        ));
        return 1;
    }

    if mode == Mode::CheckSyntax {
        return check_syntax(args, &mut diag);
    }

    let mut objects = vec![];
    let mut failed = false;

    for file in &args.files {
        match compile_file(file, args, &mut diag) {
            Ok(Some(object)) => objects.push(object),
            Ok(None) => {}
            Err(err) => {
                report(&err);
                failed = true;
            }
        }
    }

    if failed {
        diag.summary();
        return 1;
    }

    if mode == Mode::Link
        && let Err(err) = link(&objects, args)
    {
        report(&err);
        return 1;
    }

    diag.summary();
    0
}

/// Per-file syntax check, printing one status line per file.
fn check_syntax(args: &Args, diag: &mut Diagnostics) -> i32 {
    let mut failed = false;

    for file in &args.files {
        let path = leak_path(file);
        let mut importer = Importer::new(args.import_search_paths());
        match parser::parse_file(path, &mut importer, diag) {
            Ok(_) => println!("{}: Syntax OK", file.display()),
            Err(_) => {
                println!("{}: Syntax Error", file.display());
                failed = true;
            }
        }
    }

    if failed { 1 } else { 0 }
}

/// Compiles one input through the pipeline the selected mode requires.
/// Returns the object path when the file contributes to a link.
fn compile_file(file: &Path, args: &Args, diag: &mut Diagnostics) -> Result<Option<PathBuf>> {
    let mode = args.mode();

    // Assembly inputs skip straight to the assembler.
    if file.extension().is_some_and(|ext| ext == "s") {
        if matches!(
            mode,
            Mode::DumpTokens
                | Mode::DumpAst
                | Mode::DumpStmt
                | Mode::DumpReference
                | Mode::DumpSemantic
                | Mode::DumpAsm
                | Mode::Assembly
        ) {
            return Ok(None);
        }

        let object = object_path(file, args);
        assemble(file, &object)?;
        return Ok(if mode == Mode::Link { Some(object) } else { None });
    }

    let path = leak_path(file);
    debug!("compiling {}", path.display());

    let mut importer = Importer::new(args.import_search_paths());
    let mut ast = parser::parse_file(path, &mut importer, diag)?;

    match mode {
        Mode::DumpTokens => {
            lexer::dump_tokens(&ast.tokens, &mut io::stdout().lock())
                .map_err(|err| Error::File(format!("cannot write token dump: {err}")))?;
            return Ok(None);
        }
        Mode::DumpAst => {
            print!("{ast}");
            return Ok(None);
        }
        Mode::DumpStmt => {
            print!("{}", find_first_stmt(&ast, diag)?);
            return Ok(None);
        }
        _ => {}
    }

    let mut table = TypeTable::ilp32();

    sema::resolve(&mut ast, &mut table, diag)?;
    if mode == Mode::DumpReference {
        print!("{ast}");
        return Ok(None);
    }

    sema::check(&mut ast, &mut table, diag)?;
    if mode == Mode::DumpSemantic {
        print!("{ast}");
        return Ok(None);
    }

    let program = codegen::generate(ir::generate(&ast, &mut table));

    if mode == Mode::DumpAsm {
        emit::emit_gas_ia32(path, &program, args.pic, io::stdout().lock())
            .map_err(|err| Error::File(format!("cannot write assembly: {err}")))?;
        return Ok(None);
    }

    let asm_path = match (&args.output, mode) {
        (Some(output), Mode::Assembly) => output.clone(),
        _ => file.with_extension("s"),
    };

    let asm_file = fs::File::create(&asm_path).map_err(|err| {
        Error::File(format!("cannot create {}: {err}", asm_path.display()))
    })?;
    emit::emit_gas_ia32(path, &program, args.pic, asm_file)
        .map_err(|err| Error::File(format!("cannot write {}: {err}", asm_path.display())))?;

    if mode == Mode::Assembly {
        return Ok(None);
    }

    let object = object_path(file, args);
    assemble(&asm_path, &object)?;

    Ok(if mode == Mode::Link { Some(object) } else { None })
}

fn object_path(file: &Path, args: &Args) -> PathBuf {
    match (&args.output, args.mode()) {
        (Some(output), Mode::Object) => output.clone(),
        _ => file.with_extension("o"),
    }
}

/// The first statement of `main`, for `--dump-stmt`.
fn find_first_stmt<'a>(ast: &'a Ast, diag: &mut Diagnostics) -> Result<&'a Stmt> {
    let Some(main) = ast.defined_functions().find(|f| f.name == "main") else {
        diag.error_no_pos("source file does not contain main()");
        return Err(Error::Semantic);
    };

    let stmt = main.body.items.iter().find_map(|item| match item {
        BlockItem::Stmt(stmt) => Some(stmt),
        BlockItem::Decl(_) => None,
    });

    match stmt {
        Some(stmt) => Ok(stmt),
        None => {
            diag.error_no_pos("main() has no statement");
            Err(Error::Semantic)
        }
    }
}

fn assemble(asm_path: &Path, object: &Path) -> Result<()> {
    let mut cmd = Command::new("as");
    cmd.arg("--32").arg("-o").arg(object).arg(asm_path);
    invoke(cmd)
}

/// Links the objects into a dynamically linked 32-bit ELF executable.
fn link(objects: &[PathBuf], args: &Args) -> Result<()> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("a.out"));

    let mut cmd = Command::new("ld");
    cmd.arg("-m")
        .arg("elf_i386")
        .arg("-dynamic-linker")
        .arg("/lib/ld-linux.so.2");

    if !args.nostartfiles {
        cmd.arg("/usr/lib/crt1.o").arg("/usr/lib/crti.o");
    }
    for object in objects {
        cmd.arg(object);
    }
    if !args.nodefaultlibs {
        cmd.arg("-lc");
    }
    if !args.nostartfiles {
        cmd.arg("/usr/lib/crtn.o");
    }

    cmd.arg("-o").arg(output);
    invoke(cmd)
}

/// Runs an external tool synchronously, streaming its output through.
fn invoke(mut cmd: Command) -> Result<()> {
    let name = cmd.get_program().to_string_lossy().to_string();
    debug!("invoking {cmd:?}");

    let status = cmd
        .stdin(Stdio::null())
        .status()
        .map_err(|err| Error::File(format!("failed to execute {name}: {err}")))?;

    if !status.success() {
        return Err(Error::Ipc {
            cmd: name,
            status: status.code().unwrap_or(-1),
        });
    }

    Ok(())
}

/// Errors whose diagnostics were already written positioned to stderr are
/// not repeated.
fn report(err: &Error) {
    match err {
        Error::Syntax | Error::Semantic => {}
        other => {
            let _ = writeln!(io::stderr(), "cbc: error: {other}");
        }
    }
}

fn leak_path(path: &Path) -> &'static Path {
    Box::leak(path.to_path_buf().into_boxed_path())
}
