use clap::Parser;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge Go cover profiles from parallel test runs into one report.", long_about = None)]
struct Args {
    /// Input cover profiles, merged in the order given
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Path to the merged output profile
    #[arg(short, long, default_value = "coverage.txt")]
    output: PathBuf,

    /// Keep the intermediary concatenated profile
    #[arg(short, long)]
    keep: bool,
}

fn main() {
    let args = Args::parse();

    let listing = args
        .inputs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("Merging profiles: {listing}");

    let intermediate = match covermerge::concatenate_to_temp_file(&args.inputs) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = covermerge::merge_files(intermediate.path(), &args.output) {
        eprintln!("{e}");
        process::exit(1);
    }

    if args.keep {
        match intermediate.keep() {
            Ok((_, path)) => println!("intermediary profile kept at: {}", path.display()),
            Err(e) => {
                eprintln!("failed to keep intermediary profile: {e}");
                process::exit(1);
            }
        }
    }

    println!("cover profiles merged into: {}", args.output.display());
}
