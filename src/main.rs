use dashboard_sync::{
    analysis_page_fields, AnalyticsClient, BoxFuture, DashboardConfig, DashboardController,
    FetchRequest, FileStorage, MemoryHistory, PersistedCache, SystemClock,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = DashboardConfig::from_env()?;
    info!(
        api = %config.api_url,
        cache = %config.cache_path.display(),
        query = %config.query,
        "starting dashboard session"
    );

    let client = AnalyticsClient::new(config.api_url.as_str(), config.timeout)?;
    let storage = Arc::new(FileStorage::open(config.cache_path.clone()));
    let cache = PersistedCache::new(storage, Arc::new(SystemClock), &config.host);
    let history = Arc::new(MemoryHistory::new(&config.query));

    let controller = DashboardController::<Value>::builder()
        .fields(analysis_page_fields())
        .query("metadata", api_query(&client, "api/metadata"))
        .query("stats", api_query(&client, "api/stats"))
        .reference_loader({
            let client = client.clone();
            move || {
                let client = client.clone();
                async move { client.websites().await }
            }
        })
        .location(history.clone())
        .cache(cache)
        .debounce(config.debounce)
        .selection_ttl(config.selection_ttl)
        .reference_ttl(config.reference_ttl)
        .build()?;

    controller.mount();
    controller.references_settled().await;
    controller.idle().await;

    let report = json!({
        "url": history.current(),
        "selection": controller.selection(),
        "phase": controller.phase(),
        "metadata": controller.data("metadata").as_deref(),
        "stats": controller.data("stats").as_deref(),
        "error": controller.error().map(|err| err.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    controller.shutdown();
    Ok(())
}

fn api_query(
    client: &AnalyticsClient,
    path: &'static str,
) -> impl Fn(FetchRequest) -> BoxFuture<Value> + Send + Sync + 'static {
    let client = client.clone();
    move |request: FetchRequest| -> BoxFuture<Value> {
        let client = client.clone();
        Box::pin(async move { client.query(path, &request.selection).await })
    }
}
