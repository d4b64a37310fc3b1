//! LayerFlow API server
//!
//! Serves `GET /health` and `POST /api/decompose` on top of the `layerflow` library.

#[cfg(feature = "cli")]
use layerflow::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
