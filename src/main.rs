#[tokio::main]
async fn main() {
    let code = rave_cli::run().await;
    std::process::exit(code);
}
