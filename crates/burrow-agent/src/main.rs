use clap::Parser;

use burrow_agent::cli::{run, AgentArgs};

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("burrow-agent: {e}");
        std::process::exit(1);
    }
}
