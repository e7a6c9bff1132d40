// src/main.rs

use rundag::state::Status;
use rundag::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(Status::Success) => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            eprintln!("rundag error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<Status> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
