//! Redis bootstrap. One connection manager backs both the counter store and
//! the broker; it is cloned into each component.

use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_RETRIES: usize = 6;

/// Open a reconnecting connection and check it answers before returning.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(CONNECT_TIMEOUT)
        .set_number_of_retries(RECONNECT_RETRIES);
    let mut manager = ConnectionManager::new_with_config(client, config).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
