#[tokio::main]
async fn main() {
    if let Err(error) = sqlpilot_cli::cli::run_cli_process().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
