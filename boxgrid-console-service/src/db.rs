use boxgrid_common::config::{DbPostgresConfig, DbSqliteConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, Executor, PgConnection, Pool, Postgres, Sqlite, SqliteConnection};
use tracing::info;

fn postgres_connect_options(config: &DbPostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.as_str())
}

fn sqlite_connect_options(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(std::path::Path::new(config.database.as_str()))
        .create_if_missing(true)
}

pub async fn create_postgres_pool(config: &DbPostgresConfig) -> Result<Pool<Postgres>, anyhow::Error> {
    info!(
        "DB Pool: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    let conn_options = postgres_connect_options(config);
    let schema = config.schema.clone();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                if let Some(schema) = schema {
                    let sql = format!("SET SCHEMA '{schema}';");
                    conn.execute(sqlx::query(&sql)).await?;
                }
                Ok(())
            })
        })
        .connect_with(conn_options)
        .await?;
    Ok(pool)
}

pub async fn postgres_migrate(config: &DbPostgresConfig) -> Result<(), anyhow::Error> {
    info!(
        "DB migration: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    let conn_options = postgres_connect_options(config);
    let mut conn = PgConnection::connect_with(&conn_options).await?;
    if let Some(schema) = &config.schema {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {schema};");
        conn.execute(sqlx::query(&sql)).await?;
        let sql = format!("SET SCHEMA '{schema}';");
        conn.execute(sqlx::query(&sql)).await?;
    }

    sqlx::migrate!("./db/migration/postgres")
        .run(&mut conn)
        .await?;

    let _ = conn.close().await;
    Ok(())
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, anyhow::Error> {
    info!("DB Pool: sqlite://{}", config.database);
    let conn_options = sqlite_connect_options(config);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await?;
    Ok(pool)
}

pub async fn sqlite_migrate(config: &DbSqliteConfig) -> Result<(), anyhow::Error> {
    info!("DB migration: sqlite://{}", config.database);
    let conn_options = sqlite_connect_options(config);
    let mut conn = SqliteConnection::connect_with(&conn_options).await?;
    sqlx::migrate!("./db/migration/sqlite")
        .run(&mut conn)
        .await?;
    let _ = conn.close().await;
    Ok(())
}
