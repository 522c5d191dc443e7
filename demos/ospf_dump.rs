use std::env;
use std::process;
use std::time::Duration;

use anyhow::Context;
use rnetpoll::protocols::OspfFetcher;

fn print_usage() {
    eprintln!("Usage: cargo run --example ospf_dump -- (--file <dump.bin> | --host <router>) [--idle-ms <ms>]");
}

fn print_headers(headers: &[(rnetpoll::codec::ChangeHeader, rnetpoll::codec::LsaHeader)]) {
    for (change, lsa) in headers {
        println!(
            "area={} iface={} self={} type={:?} id={} adv={} seq={:#010x} len={}",
            change.area_id,
            change.interface,
            change.self_originated,
            lsa.lsa_type,
            lsa.link_state_id,
            lsa.advertising_router,
            lsa.sequence,
            lsa.length
        );
    }
    println!("{} LSAs", headers.len());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut file = None;
    let mut host = None;
    let mut idle = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" => file = iter.next().cloned(),
            "--host" => host = iter.next().cloned(),
            "--idle-ms" => {
                let ms: u64 = iter
                    .next()
                    .context("--idle-ms needs a value")?
                    .parse()
                    .context("--idle-ms must be a number")?;
                idle = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            unknown => {
                eprintln!("Unknown argument: {unknown}");
                print_usage();
                process::exit(2);
            }
        }
    }

    let headers = match (file, host) {
        (Some(path), None) => {
            let mut fetcher = OspfFetcher::dump(&path);
            if let Some(idle) = idle {
                fetcher.set_idle_timeout(idle);
            }
            fetcher
                .fetch_lsa_headers()
                .await
                .with_context(|| format!("reading {path}"))?
        }
        (None, Some(host)) => {
            let mut fetcher = OspfFetcher::live(&host);
            if let Some(idle) = idle {
                fetcher.set_idle_timeout(idle);
            }
            fetcher
                .fetch_lsa_headers()
                .await
                .with_context(|| format!("fetching LSDB from {host}"))?
        }
        _ => {
            print_usage();
            process::exit(2);
        }
    };
    print_headers(&headers);
    Ok(())
}
