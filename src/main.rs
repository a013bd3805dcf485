#[tokio::main]
async fn main() {
    if let Err(e) = toolgate_lib::run().await {
        eprintln!("toolgate: {}", e);
        std::process::exit(1);
    }
}
