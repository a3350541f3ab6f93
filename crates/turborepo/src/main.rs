use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    // TURBO_LOG_VERBOSITY drives tracing output; errors are rendered by
    // miette below rather than the subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TURBO_LOG_VERBOSITY")
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start async runtime")
        .block_on(run());

    process::exit(exit_code);
}

async fn run() -> i32 {
    match turborepo_lib::run().await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            1
        }
    }
}
