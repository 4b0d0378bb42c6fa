//! Schema for the reference application.

use keel_core::{DatabasePool, Dialect, Result};

/// Create the application tables if they do not exist yet
///
/// # Errors
///
/// Returns `Error::Database` if a statement fails.
pub async fn run(pool: &DatabasePool) -> Result<()> {
    let id = match pool.dialect() {
        Dialect::Sqlite => "integer primary key autoincrement",
        Dialect::Postgres => "bigserial primary key",
    };

    let statements = [
        format!(
            "create table if not exists users (id {id}, name text not null, \
             email text not null unique, created_at text, updated_at text)"
        ),
        format!(
            "create table if not exists posts (id {id}, user_id bigint not null, \
             title text not null, body text, created_at text, updated_at text)"
        ),
        format!(
            "create table if not exists comments (id {id}, post_id bigint not null, \
             user_id bigint not null, body text not null, created_at text, updated_at text)"
        ),
    ];

    for sql in &statements {
        pool.execute(sql, &[]).await?;
    }
    tracing::info!(tables = statements.len(), "Migrations applied");
    Ok(())
}
