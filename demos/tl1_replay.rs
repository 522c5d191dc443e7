use std::env;
use std::process;

use anyhow::Context;
use rnetpoll::codec::{Category, parse_section_block};
use rnetpoll::protocols::tl1;
use rnetpoll::session::{Credentials, SessionRecorder};

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example tl1_replay -- <transcript.log> <command> [<command>...] [--user <name>] [--jsonl <out.jsonl>]"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let Some(transcript) = args.next() else {
        print_usage();
        process::exit(2);
    };

    let mut commands = Vec::new();
    let mut user = String::new();
    let mut jsonl = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--user" => user = args.next().context("--user needs a value")?,
            "--jsonl" => jsonl = Some(args.next().context("--jsonl needs a value")?),
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            _ => commands.push(arg),
        }
    }
    if commands.is_empty() {
        print_usage();
        process::exit(2);
    }

    let mut session = tl1::tl1_replay(&transcript);
    let recorder = SessionRecorder::default();
    session.set_recorder(recorder.clone());
    session.set_autonomous_callback(Some(Category::Critical), |alarm| {
        println!("critical alarm: {:?}", alarm.lines());
    });
    session
        .start(Credentials::new(user, None))
        .await
        .with_context(|| format!("replaying {transcript}"))?;

    for command in &commands {
        match session.command(command).await {
            Ok(lines) => {
                println!("{command}");
                for line in lines {
                    match line.split_once(':') {
                        Some((aid, params)) => {
                            println!("  {aid} {:?}", parse_section_block(params))
                        }
                        None => println!("  {line}"),
                    }
                }
            }
            Err(err) => println!("{command}\n  failed: {err}"),
        }
    }
    session.stop().await?;

    if let Some(path) = jsonl {
        std::fs::write(&path, recorder.to_jsonl()?)
            .with_context(|| format!("writing {path}"))?;
        println!("Recording written to {path}");
    }
    Ok(())
}
