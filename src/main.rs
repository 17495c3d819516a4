use anyhow::{bail, Result};
use reelfeed::{app, cache::Source};

const HELP: &str = "reelfeed - short-video reel feed with a bounded media cache.

  --version, -V          Show version and exit
  --help,    -h          Show this help message
  --stats                Show cache entries, bytes and capacity
  --warm <url>           Fetch the first segment of <url> through the cache
  --invalidate <url>     Drop every cached range of <url>
  --play <url>...        Interactive reel over the given urls";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_info_flags(&args) {
        return;
    }

    if let Err(err) = reelfeed::logging::init() {
        eprintln!("warning: {err:#}");
    }
    if let Err(err) = run(&args) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_info_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("reelfeed {}", reelfeed::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{HELP}");
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

fn run(args: &[String]) -> Result<()> {
    let Some((command, rest)) = args.split_first() else {
        println!("{HELP}");
        return Ok(());
    };
    match command.as_str() {
        "--stats" => {
            let services = app::open_services()?;
            let stats = app::stats(&services);
            println!(
                "entries: {}\nbytes: {}\ncapacity: {}",
                stats.entries, stats.total_bytes, stats.capacity_bytes
            );
        }
        "--warm" => {
            let url = single_url(command, rest)?;
            let services = app::open_services()?;
            let (source, len) = app::warm(&services, url)?;
            let label = match source {
                Source::Hit => "hit",
                Source::Stored => "stored",
                Source::NotCacheable => "not cacheable",
            };
            println!("{label}: {len} bytes");
        }
        "--invalidate" => {
            let url = single_url(command, rest)?;
            let services = app::open_services()?;
            let removed = app::invalidate(&services, url);
            println!("removed {removed} cached ranges");
        }
        "--play" => {
            if rest.is_empty() {
                bail!("--play needs at least one url");
            }
            let services = app::open_services()?;
            app::play(services, rest.to_vec())?;
        }
        other => bail!("unknown argument: {other} (see --help)"),
    }
    Ok(())
}

fn single_url<'a>(flag: &str, rest: &'a [String]) -> Result<&'a str> {
    match rest {
        [url] => Ok(url.as_str()),
        _ => bail!("{flag} takes exactly one url"),
    }
}
