use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{execute_async, DbPool};
use crate::node_cache::UserDirectory;
use crate::types::{Node, NodeId, TransportKind, User, UserId};

const NODE_COLUMNS: &str = "id, name, host, port, transport, rest, protocol_settings, rate_limit, tags, network, traffic_limit, enabled";

const USER_COLUMNS: &str =
    "id, email, uuid, speed_limit, device_limit, transfer_enable, enabled, expired_at";

/// Raw node row; nested settings are still JSON text.
struct NodeRow {
    id: i64,
    name: String,
    host: String,
    port: i64,
    transport: String,
    rest: Option<String>,
    protocol_settings: String,
    rate_limit: String,
    tags: String,
    network: String,
    traffic_limit: i64,
    enabled: bool,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            transport: row.get(4)?,
            rest: row.get(5)?,
            protocol_settings: row.get(6)?,
            rate_limit: row.get(7)?,
            tags: row.get(8)?,
            network: row.get(9)?,
            traffic_limit: row.get(10)?,
            enabled: row.get(11)?,
        })
    }

    fn into_node(self) -> Result<Node> {
        let id = self.id as NodeId;
        let transport: TransportKind =
            serde_json::from_value(serde_json::Value::String(self.transport))
                .with_context(|| format!("Unknown transport for node {}", id))?;
        let rest = self
            .rest
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("Invalid REST endpoint for node {}", id))?;

        Ok(Node {
            id,
            name: self.name,
            host: self.host,
            port: u16::try_from(self.port)
                .with_context(|| format!("Port out of range for node {}", id))?,
            transport,
            rest,
            protocol_settings: serde_json::from_str(&self.protocol_settings)
                .with_context(|| format!("Invalid protocol settings for node {}", id))?,
            rate_limit: serde_json::from_str(&self.rate_limit)
                .with_context(|| format!("Invalid rate limit for node {}", id))?,
            tags: serde_json::from_str(&self.tags)
                .with_context(|| format!("Invalid tags for node {}", id))?,
            network: self.network,
            traffic_limit: self.traffic_limit.max(0) as u64,
            enabled: self.enabled,
        })
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(User, String)> {
    let uuid: String = row.get(2)?;
    let user = User {
        id: row.get::<_, i64>(0)? as UserId,
        email: row.get(1)?,
        uuid: Uuid::nil(),
        speed_limit: row.get::<_, Option<i64>>(3)?.map(|v| v.max(0) as u64),
        device_limit: row.get::<_, Option<i64>>(4)?.map(|v| v.max(0) as u32),
        transfer_enable: row.get::<_, i64>(5)?.max(0) as u64,
        enabled: row.get(6)?,
        expired_at: row.get(7)?,
    };
    Ok((user, uuid))
}

fn finish_user((mut user, uuid): (User, String)) -> Result<User> {
    user.uuid = Uuid::parse_str(&uuid).with_context(|| format!("Invalid uuid for user {}", user.id))?;
    Ok(user)
}

/// Insert or replace a node record
pub fn upsert_node(conn: &Connection, node: &Node) -> Result<()> {
    let rest = node.rest.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            NODE_COLUMNS
        ),
        rusqlite::params![
            node.id as i64,
            node.name,
            node.host,
            node.port,
            node.transport.as_str(),
            rest,
            serde_json::to_string(&node.protocol_settings)?,
            serde_json::to_string(&node.rate_limit)?,
            serde_json::to_string(&node.tags)?,
            node.network,
            i64::try_from(node.traffic_limit).unwrap_or(i64::MAX),
            node.enabled,
        ],
    )
    .context("Failed to upsert node")?;

    Ok(())
}

pub fn get_node(conn: &Connection, node_id: NodeId) -> Result<Option<Node>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
            rusqlite::params![node_id as i64],
            NodeRow::from_row,
        )
        .optional()
        .context("Failed to query node")?;

    row.map(NodeRow::into_node).transpose()
}

/// List all nodes ordered by id
pub fn list_nodes(conn: &Connection) -> Result<Vec<Node>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS))
        .context("Failed to prepare statement")?;

    let rows = stmt
        .query_map([], NodeRow::from_row)
        .context("Failed to query nodes")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect nodes")?;

    rows.into_iter().map(NodeRow::into_node).collect()
}

/// Insert or replace a user record
pub fn upsert_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            USER_COLUMNS
        ),
        rusqlite::params![
            user.id as i64,
            user.email,
            user.uuid.to_string(),
            user.speed_limit.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
            user.device_limit,
            i64::try_from(user.transfer_enable).unwrap_or(i64::MAX),
            user.enabled,
            user.expired_at,
        ],
    )
    .context("Failed to upsert user")?;

    Ok(())
}

pub fn get_user(conn: &Connection, user_id: UserId) -> Result<Option<User>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [user_id as i64],
            user_from_row,
        )
        .optional()
        .context("Failed to query user")?;

    row.map(finish_user).transpose()
}

/// Every user, active or not, ascending by id.
pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))
        .context("Failed to prepare statement")?;

    let rows = stmt
        .query_map([], user_from_row)
        .context("Failed to query users")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect users")?;

    rows.into_iter().map(finish_user).collect()
}

/// Enabled, unexpired users with id greater than `after`, ascending by id.
pub fn active_users_after(
    conn: &Connection,
    after: Option<UserId>,
    now: i64,
    limit: usize,
) -> Result<Vec<User>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {} FROM users
             WHERE enabled = 1 AND id > ?1 AND (expired_at IS NULL OR expired_at > ?2)
             ORDER BY id LIMIT ?3",
            USER_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let after = after.map(|id| id as i64).unwrap_or(-1);
    let rows = stmt
        .query_map(rusqlite::params![after, now, limit as i64], user_from_row)
        .context("Failed to query users")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect users")?;

    rows.into_iter().map(finish_user).collect()
}

/// Async handle over the inventory tables.
#[derive(Clone)]
pub struct Inventory {
    pool: DbPool,
}

impl Inventory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        execute_async(&self.pool, |conn| list_nodes(conn)).await
    }

    pub async fn get_node(&self, node_id: NodeId) -> Result<Option<Node>> {
        execute_async(&self.pool, move |conn| get_node(conn, node_id)).await
    }

    pub async fn upsert_node(&self, node: Node) -> Result<()> {
        execute_async(&self.pool, move |conn| upsert_node(conn, &node)).await
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        execute_async(&self.pool, move |conn| get_user(conn, user_id)).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        execute_async(&self.pool, |conn| list_users(conn)).await
    }

    pub async fn upsert_user(&self, user: User) -> Result<()> {
        execute_async(&self.pool, move |conn| upsert_user(conn, &user)).await
    }
}

#[async_trait]
impl UserDirectory for Inventory {
    async fn active_users_after(
        &self,
        after: Option<UserId>,
        now: i64,
        limit: usize,
    ) -> Result<Vec<User>> {
        execute_async(&self.pool, move |conn| active_users_after(conn, after, now, limit)).await
    }
}
