#[tokio::main]
async fn main() -> std::io::Result<()> {
    sim_engine::run_with_config().await.map(|_| ())
}
