use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager backing the dispatch queue.
///
/// The manager reconnects on its own, so a single instance is cloned into
/// every worker and into the API state.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!(redis_url, "Connected to Redis");
    Ok(manager)
}
