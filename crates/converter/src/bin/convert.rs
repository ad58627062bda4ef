//! Model conversion tool
//!
//! Converts an Anime4K CNN between any two supported formats, chosen from the
//! file extensions of the input and output paths.

use std::path::PathBuf;
use std::process;

use anime4k_converter::Result;
use anime4k_converter::formats::{Conversion, DEFAULT_DESCRIPTOR_INCLUDE, WriteOptions};
use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "convert", about = "Convert Anime4K CNN models between checkpoint and shader formats")]
struct Args {
    /// Input model (.pth, .safetensors, .json, .comp, .glsl or .hlsl)
    input: PathBuf,

    /// Output model (.pth, .safetensors, .comp, .glsl or .hlsl)
    output: PathBuf,

    /// Include path of the descriptor-set header in generated .comp shaders
    #[arg(long, default_value = DEFAULT_DESCRIPTOR_INCLUDE)]
    descriptor_include: String,

    /// Print the architecture and enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    let options = WriteOptions {
        descriptor_include: args.descriptor_include.clone(),
    };

    if let Err(e) = run(&args, &options) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: &Args, options: &WriteOptions) -> Result<()> {
    let conversion = Conversion::read(&args.input, &args.output)?;

    let label = conversion.model.variant_label();
    if args.verbose {
        let arch = conversion.model.arch;
        println!("Architecture: Anime4K CNN x2 {label}");
        println!("  {arch}");
        println!("Total passes: {}", arch.logical_pass_count());
    }

    conversion.write(&args.output, options)?;
    println!(
        "Converted {} -> {}: {} -> {} ({label})",
        conversion.input_format,
        conversion.output_format,
        args.input.display(),
        args.output.display()
    );
    Ok(())
}
