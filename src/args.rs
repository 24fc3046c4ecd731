//! Command-line interface of the compiler driver.

use std::path::PathBuf;

use clap::Parser;

/// Ahead-of-time compiler for the Cb language, targeting 32-bit x86.
#[derive(Debug, Parser)]
#[command(name = "cbc", version, about, long_about = None)]
pub struct Args {
    /// Input files: Cb sources (.cb) or assembly files (.s)
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Check syntax only, reporting per file
    #[arg(long, group = "mode")]
    pub check_syntax: bool,

    /// Print the token stream and stop
    #[arg(long, group = "mode")]
    pub dump_tokens: bool,

    /// Print the AST and stop
    #[arg(long, group = "mode")]
    pub dump_ast: bool,

    /// Print the first statement of main() and stop
    #[arg(long, group = "mode")]
    pub dump_stmt: bool,

    /// Print the AST after reference resolution and stop
    #[arg(long, group = "mode")]
    pub dump_reference: bool,

    /// Print the AST after type checking and stop
    #[arg(long, group = "mode")]
    pub dump_semantic: bool,

    /// Print the generated assembly and stop
    #[arg(long, group = "mode")]
    pub dump_asm: bool,

    /// Stop after generating assembly (.s)
    #[arg(short = 'S', group = "mode")]
    pub stop_after_assembly: bool,

    /// Stop after assembling (.o)
    #[arg(short = 'c', group = "mode")]
    pub stop_after_object: bool,

    /// Place the output in FILE
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Add DIR to the import search path
    #[arg(short = 'I', value_name = "DIR")]
    pub import_paths: Vec<PathBuf>,

    /// Generate position-independent code
    #[arg(long = "fpic")]
    pub pic: bool,

    /// Do not link the C runtime startup files
    #[arg(long)]
    pub nostartfiles: bool,

    /// Do not link the default libraries
    #[arg(long)]
    pub nodefaultlibs: bool,

    /// Trace compiler phases and external commands
    #[arg(short, long)]
    pub verbose: bool,
}

/// What the driver should produce. The mode switches are mutually
/// exclusive; absent any, the driver compiles, assembles, and links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    CheckSyntax,
    DumpTokens,
    DumpAst,
    DumpStmt,
    DumpReference,
    DumpSemantic,
    DumpAsm,
    /// `-S`
    Assembly,
    /// `-c`
    Object,
    Link,
}

impl Args {
    pub fn mode(&self) -> Mode {
        if self.check_syntax {
            Mode::CheckSyntax
        } else if self.dump_tokens {
            Mode::DumpTokens
        } else if self.dump_ast {
            Mode::DumpAst
        } else if self.dump_stmt {
            Mode::DumpStmt
        } else if self.dump_reference {
            Mode::DumpReference
        } else if self.dump_semantic {
            Mode::DumpSemantic
        } else if self.dump_asm {
            Mode::DumpAsm
        } else if self.stop_after_assembly {
            Mode::Assembly
        } else if self.stop_after_object {
            Mode::Object
        } else {
            Mode::Link
        }
    }

    /// Import search path: the `-I` directories, then the current directory.
    pub fn import_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.import_paths.clone();
        paths.push(PathBuf::from("."));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_link() {
        let args = Args::parse_from(["cbc", "main.cb"]);
        assert_eq!(args.mode(), Mode::Link);
    }

    #[test]
    fn stage_flags_select_modes() {
        let args = Args::parse_from(["cbc", "-S", "main.cb"]);
        assert_eq!(args.mode(), Mode::Assembly);

        let args = Args::parse_from(["cbc", "--check-syntax", "main.cb"]);
        assert_eq!(args.mode(), Mode::CheckSyntax);

        let args = Args::parse_from(["cbc", "--dump-asm", "main.cb"]);
        assert_eq!(args.mode(), Mode::DumpAsm);
    }

    #[test]
    fn mode_flags_are_mutually_exclusive() {
        assert!(Args::try_parse_from(["cbc", "-S", "-c", "main.cb"]).is_err());
        assert!(Args::try_parse_from(["cbc", "--dump-ast", "--dump-tokens", "main.cb"]).is_err());
    }

    #[test]
    fn import_paths_accumulate() {
        let args = Args::parse_from(["cbc", "-I", "lib", "-I", "sys", "main.cb"]);
        let paths = args.import_search_paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], PathBuf::from("lib"));
    }
}
