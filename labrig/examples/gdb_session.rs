//! GDB example: drive a nested interactive program over a PTY
//!
//! Spawns `gdb` against a local binary, waits for its prompt, and runs a few
//! commands with the prompt scoped to the GDB session.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example gdb_session -- --binary /usr/bin/true --timeout 10
//! ```

use std::env;
use std::time::Duration;

use labrig::channel::{LogSink, Prompt, PtyBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("Starting gdb on {}...", args.binary);
    let mut ch = PtyBuilder::new("gdb")
        .args(["-nx", "-q", args.binary.as_str()])
        .env("TERM", "dumb")
        .timeout(Duration::from_secs(args.timeout))
        .spawn()?;

    {
        let mut gdb = ch.with_prompt(Prompt::anchored(r"\(gdb\)")?);
        let mut gdb = gdb.with_stream(LogSink::new("gdb"), false);

        gdb.read_until_prompt().await?;
        gdb.send_line("set pagination off", true).await?;
        gdb.read_until_prompt().await?;

        for command in ["info files", "info sharedlibrary"] {
            println!("\n>>> {}", command);
            gdb.send_line(command, true).await?;
            println!("{}", gdb.read_until_prompt().await?);
        }

        gdb.send_line("quit", false).await?;
        gdb.terminate0().await?;
    }

    println!("gdb exited");
    Ok(())
}

struct Args {
    binary: String,
    timeout: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut binary = "/usr/bin/true".to_string();
        let mut timeout = 10u64;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--binary" | "-b" => {
                    i += 1;
                    if i < args.len() {
                        binary = args[i].clone();
                    }
                }
                "--timeout" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        timeout = args[i].parse().unwrap_or(10);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Self { binary, timeout }
    }
}
