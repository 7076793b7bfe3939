// src/main.rs

use rundag::{cli, logging};

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(e) = logging::init_logging(args.log_level) {
        eprintln!("rundag: failed to initialise logging: {e}");
        std::process::exit(2);
    }

    match rundag::run(args).await {
        Ok(summary) if summary.success() => {}
        Ok(summary) => {
            eprintln!("rundag: {} task(s) failed", summary.failed);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("rundag: {e}");
            std::process::exit(2);
        }
    }
}
