use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct NodeRecord {
    pub id: i64,
    pub name: String,
    pub token_hash: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub agent_version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub token_hash: String,
}

/// Agent self-description sent as request headers at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfoUpdate {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
}

const NODE_COLUMNS: &str = "id, name, token_hash, ipv4, ipv6, agent_version, platform, arch, \
                            last_seen_at, created_at, updated_at";

pub async fn create_node(pool: &Db, new_node: NewNode) -> Result<NodeRecord> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO nodes (name, token_hash, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        "#,
    )
    .bind(&new_node.name)
    .bind(&new_node.token_hash)
    .bind(now)
    .execute(pool)
    .await?;

    get_node(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| anyhow::anyhow!("node insert did not return row"))
}

pub async fn get_node(pool: &Db, id: i64) -> Result<Option<NodeRecord>> {
    let record = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn find_by_token_hash(pool: &Db, token_hash: &str) -> Result<Option<NodeRecord>> {
    let record = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE token_hash = ?1"
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_nodes(pool: &Db, limit: u32) -> Result<Vec<NodeRecord>> {
    let records = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes ORDER BY id LIMIT ?1"
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_nodes_by_ids(pool: &Db, ids: &[i64]) -> Result<Vec<NodeRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ("));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY id");
    let records = builder
        .build_query_as::<NodeRecord>()
        .fetch_all(pool)
        .await?;
    Ok(records)
}

pub async fn update_ipv4(pool: &Db, id: i64, ipv4: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE nodes SET ipv4 = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(ipv4)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_ipv6(pool: &Db, id: i64, ipv6: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE nodes SET ipv6 = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(ipv6)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Record agent headers; absent values keep what was stored before.
pub async fn record_agent_info(pool: &Db, id: i64, info: &AgentInfoUpdate) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET agent_version = COALESCE(?1, agent_version),
            platform = COALESCE(?2, platform),
            arch = COALESCE(?3, arch),
            last_seen_at = ?4,
            updated_at = ?4
        WHERE id = ?5
        "#,
    )
    .bind(&info.version)
    .bind(&info.platform)
    .bind(&info.arch)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::{init_pool, run_migrations};

    async fn db() -> Db {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.into(),
            token_hash: format!("hash-{name}"),
        }
    }

    #[tokio::test]
    async fn create_and_lookup_by_token_hash() {
        let pool = db().await;
        let node = create_node(&pool, new_node("edge-1")).await.expect("create");
        assert!(node.ipv4.is_none());

        let found = find_by_token_hash(&pool, "hash-edge-1")
            .await
            .expect("query")
            .expect("node");
        assert_eq!(found.id, node.id);
        assert!(find_by_token_hash(&pool, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn agent_info_keeps_previous_values_when_headers_missing() {
        let pool = db().await;
        let node = create_node(&pool, new_node("edge-2")).await.unwrap();
        record_agent_info(
            &pool,
            node.id,
            &AgentInfoUpdate {
                version: Some("v1.2.0".into()),
                platform: Some("linux".into()),
                arch: Some("amd64".into()),
            },
        )
        .await
        .unwrap();
        record_agent_info(
            &pool,
            node.id,
            &AgentInfoUpdate {
                version: Some("v1.3.0".into()),
                ..AgentInfoUpdate::default()
            },
        )
        .await
        .unwrap();

        let stored = get_node(&pool, node.id).await.unwrap().unwrap();
        assert_eq!(stored.agent_version.as_deref(), Some("v1.3.0"));
        assert_eq!(stored.platform.as_deref(), Some("linux"));
        assert!(stored.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn address_updates_and_id_listing() {
        let pool = db().await;
        let a = create_node(&pool, new_node("a")).await.unwrap();
        let b = create_node(&pool, new_node("b")).await.unwrap();
        let _c = create_node(&pool, new_node("c")).await.unwrap();

        assert!(update_ipv4(&pool, a.id, "203.0.113.7").await.unwrap());
        assert!(update_ipv6(&pool, a.id, "2001:db8::1").await.unwrap());
        assert!(!update_ipv4(&pool, 9_999, "203.0.113.8").await.unwrap());
        let stored = get_node(&pool, a.id).await.unwrap().unwrap();
        assert_eq!(stored.ipv4.as_deref(), Some("203.0.113.7"));
        assert_eq!(stored.ipv6.as_deref(), Some("2001:db8::1"));

        let listed = list_nodes_by_ids(&pool, &[b.id, a.id, 9_999]).await.unwrap();
        assert_eq!(
            listed.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
        assert_eq!(list_nodes(&pool, 2).await.unwrap().len(), 2);
    }
}
