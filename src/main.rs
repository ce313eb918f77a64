#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gemini_overlay::run().await
}
