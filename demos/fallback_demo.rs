use resilient_cache::{CacheAdmin, CacheConfig, CacheServiceBuilder, CacheStrategy, SetOptions};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .init();

    // REDIS_URL=redis://127.0.0.1:1 shows the service starting in fallback mode
    let config = CacheConfig::from_env()?;
    let cache = CacheServiceBuilder::new().config(config).build().await?;
    tracing::info!(mode = %cache.mode(), "Cache service ready");

    let options = SetOptions::new()
        .namespace("products")
        .strategy(CacheStrategy::ShortTerm)
        .tag("catalog");
    for id in 1..=3 {
        let product = Product { id, name: format!("Product {id}") };
        cache.set(&id.to_string(), &product, &options).await;
    }

    let product: Option<Product> = cache.get("1", Some("products")).await;
    tracing::info!(?product, "Read back");

    let computed: Product = cache
        .get_or_set("99", options.clone(), || async {
            Ok::<_, anyhow::Error>(Product { id: 99, name: "Computed".to_string() })
        })
        .await?;
    tracing::info!(?computed, "Cache-aside result");

    let removed = cache.invalidate_tag("catalog").await;
    tracing::info!(removed, "Tag invalidated");

    let admin = CacheAdmin::new(cache.clone());
    println!("{}", serde_json::to_string_pretty(&admin.statistics())?);

    cache.shutdown().await;
    Ok(())
}
