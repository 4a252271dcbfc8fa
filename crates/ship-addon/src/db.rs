use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

pub async fn init_db(database_url: &str, max_connections: u32) -> anyhow::Result<Pool<Postgres>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!("migrations applied");
    Ok(pool)
}
