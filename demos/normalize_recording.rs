use rnetpoll::session::{NormalizeOptions, SessionRecorder};
use std::env;
use std::fs;
use std::process;

use anyhow::Context;

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example normalize_recording -- <input.jsonl> <output.jsonl> [--keep-raw] [--drop-autonomous]"
    );
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        print_usage();
        process::exit(2);
    }

    let input = &args[1];
    let output = &args[2];

    let mut options = NormalizeOptions::default();
    for flag in args.iter().skip(3) {
        match flag.as_str() {
            "--keep-raw" => options.keep_raw_chunks = true,
            "--drop-autonomous" => options.keep_autonomous = false,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            unknown => {
                eprintln!("Unknown flag: {unknown}");
                print_usage();
                process::exit(2);
            }
        }
    }

    let content =
        fs::read_to_string(input).with_context(|| format!("reading input file '{input}'"))?;
    let normalized = SessionRecorder::normalize_jsonl(&content, options)
        .context("normalizing recording")?;
    fs::write(output, normalized).with_context(|| format!("writing output file '{output}'"))?;

    println!("Normalized recording written to {output}");
    Ok(())
}
