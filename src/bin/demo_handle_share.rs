// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_handle_share publish <key> <path>
//   demo_handle_share fetch <key> [timeout_ms]
//
// The publisher opens <path>, publishes its file handle under <key>, prints
// "published" and keeps the handle alive until a line (or EOF) arrives on
// stdin. The fetcher waits for the publication, duplicates the handle into
// its own process and prints the file contents read through the duplicate.

use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::process::ExitCode;
use std::time::Duration;

use xproc::{HandlePublisher, PollPolicy};

const USAGE: &str = "usage: demo_handle_share publish <key> <path>\n       demo_handle_share fetch <key> [timeout_ms]";

fn do_publish(key: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(path)?;

    #[cfg(unix)]
    let handle = std::os::fd::AsFd::as_fd(&file);
    #[cfg(windows)]
    let handle = std::os::windows::io::AsHandle::as_handle(&file);

    let publisher = HandlePublisher::publish(key, handle)?;
    println!("published");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    drop(publisher);
    println!("retracted");
    Ok(())
}

fn do_fetch(key: &str, timeout_ms: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let policy = match timeout_ms {
        Some(ms) => PollPolicy::with_timeout(Duration::from_millis(ms)),
        None => PollPolicy::default(),
    };
    let owned = xproc::wait_for_handle(key, &policy)?;

    // The duplicate shares the file position with the publisher's handle.
    let mut file = File::from(owned);
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    print!("{contents}");
    io::stdout().flush()?;
    Ok(())
}

fn main() -> ExitCode {
    xproc::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    }

    let res = match args[1].as_str() {
        "publish" => {
            let Some(path) = args.get(3) else {
                eprintln!("{USAGE}");
                return ExitCode::FAILURE;
            };
            do_publish(&args[2], path)
        }
        "fetch" => {
            let timeout_ms = match args.get(3).map(|s| s.parse::<u64>()) {
                None => None,
                Some(Ok(ms)) => Some(ms),
                Some(Err(e)) => {
                    eprintln!("bad timeout_ms: {e}");
                    return ExitCode::FAILURE;
                }
            };
            do_fetch(&args[2], timeout_ms)
        }
        other => {
            eprintln!("unknown mode: {other}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
