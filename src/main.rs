//! droidherd - Keep a fleet of Android devices reachable
//!
//! This is the binary entry point. All logic lives in the library.

use clap::Parser;
use droidherd::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    // Logs go to a file so stdout stays free for command output
    herd_core::logging::init()?;

    droidherd::run(args).await?;
    Ok(())
}
