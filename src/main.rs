use clap::Parser;
use claude_chat::cli::{self, Args};
use colored::Colorize;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = cli::run(args).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
