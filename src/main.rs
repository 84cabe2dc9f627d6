use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = actual_bank_sync::args::parse();
    actual_bank_sync::cli::main(args).await
}
