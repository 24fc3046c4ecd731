//! cbc: an ahead-of-time compiler for the Cb language, targeting 32-bit
//! x86 (ILP32 System V).

mod args;
mod compiler;
mod error;

use clap::Parser;

fn main() {
    let args = args::Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    std::process::exit(compiler::driver::run(&args));
}
