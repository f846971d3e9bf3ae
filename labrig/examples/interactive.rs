//! Interactive example: hand the lab host's shell to your terminal
//!
//! Requests the default lab host (a local bash) from a context, runs a
//! command, then attaches the terminal until you press Ctrl-D.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example interactive
//! ```

use labrig::role::LAB_HOST;
use labrig::{Context, LocalShell};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ctx = Context::global();
    let _scope = ctx.enter();

    let lab = ctx.request(LAB_HOST).await?;
    {
        let mut shell = lab.lock_as::<LocalShell>().await?;
        println!("{}", shell.exec("uname -a").await?.trim());

        println!("Attaching; press Ctrl-D to detach.");
        let ch = shell.channel();
        ch.send_line("", false).await?;
        ch.attach_interactive().await?;
        println!("\nDetached.");
    }
    lab.release().await?;

    Ok(())
}
