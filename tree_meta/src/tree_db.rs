use crate::{NameRecord, NewNode, TreeNode};
use log::warn;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use vfs_lib::{ContentId, PeerKey, VfsError, VfsResult};

/// First sequence number handed out by a fresh installation.
pub const SEQUENCE_BASE: u64 = 1000;

const SETTING_SEQUENCE: &str = "sequence";
const SETTING_REDIRECT_INDEX: &str = "redirect_index";
const SETTING_REDIRECT_URL: &str = "redirect_url";
const SETTING_PUBLISH_INTERVAL: &str = "publish_interval_hours";
const SETTING_PUBLISHER_ENABLED: &str = "publisher_enabled";

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn db_err(e: rusqlite::Error) -> VfsError {
    VfsError::DbError(e.to_string())
}

/// Relational mirror of the virtual filesystem plus the name-record and
/// settings tables. Single source of truth for node state; conflicting
/// writes to one row serialize on the connection mutex and the
/// state-transition updates carry `WHERE deleting = 0` guards so a
/// tombstoned node is never resurrected.
#[derive(Clone)]
pub struct TreeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TreeStore {
    pub fn open(db_path: impl AsRef<Path>) -> VfsResult<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(db_err)?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_schema(conn: &Connection) -> VfsResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tree_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL DEFAULT '',
                mime_type TEXT NOT NULL DEFAULT '',
                content TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                source_uri TEXT,
                last_modified INTEGER NOT NULL DEFAULT 0,
                progress INTEGER NOT NULL DEFAULT 0,
                job TEXT,
                init INTEGER NOT NULL DEFAULT 0,
                leaching INTEGER NOT NULL DEFAULT 0,
                seeding INTEGER NOT NULL DEFAULT 0,
                deleting INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tree_nodes_parent
                ON tree_nodes (parent);
            CREATE INDEX IF NOT EXISTS idx_tree_nodes_content
                ON tree_nodes (content);
            CREATE TABLE IF NOT EXISTS name_records (
                peer TEXT PRIMARY KEY,
                content TEXT,
                sequence INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS dns_links (
                domain TEXT PRIMARY KEY,
                link TEXT NOT NULL,
                updated INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(db_err)
    }

    fn node_from_row(row: &Row<'_>) -> rusqlite::Result<TreeNode> {
        let content: Option<String> = row.get("content")?;
        Ok(TreeNode {
            id: row.get("id")?,
            parent: row.get("parent")?,
            name: row.get("name")?,
            mime_type: row.get("mime_type")?,
            content: content.map(ContentId::from_trusted),
            size: row.get("size")?,
            source_uri: row.get("source_uri")?,
            last_modified: row.get("last_modified")?,
            progress: row.get("progress")?,
            job: row.get("job")?,
            init: row.get("init")?,
            leaching: row.get("leaching")?,
            seeding: row.get("seeding")?,
            deleting: row.get("deleting")?,
        })
    }

    // ---------- tree nodes ----------

    pub fn create_node(&self, node: &NewNode) -> VfsResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tree_nodes
                (parent, name, mime_type, content, size, source_uri,
                 last_modified, init, seeding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                node.parent,
                node.name,
                node.mime_type,
                node.content.as_ref().map(|c| c.as_str()),
                node.size,
                node.source_uri,
                unix_millis(),
                node.init,
                node.seeding,
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn node(&self, id: i64) -> VfsResult<Option<TreeNode>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM tree_nodes WHERE id = ?1",
            params![id],
            Self::node_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn remove_node(&self, id: i64) -> VfsResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tree_nodes WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(())
    }

    fn query_nodes(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> VfsResult<Vec<TreeNode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, Self::node_from_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn children(&self, parent: i64) -> VfsResult<Vec<TreeNode>> {
        self.query_nodes(
            "SELECT * FROM tree_nodes WHERE parent = ?1",
            &[&parent],
        )
    }

    pub fn visible_children(&self, parent: i64) -> VfsResult<Vec<TreeNode>> {
        self.query_nodes(
            "SELECT * FROM tree_nodes WHERE parent = ?1 AND deleting = 0",
            &[&parent],
        )
    }

    /// Sum of sizes of the non-deleting children of `parent`.
    pub fn children_total_size(&self, parent: i64) -> VfsResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM tree_nodes
             WHERE parent = ?1 AND deleting = 0",
            params![parent],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    pub fn nodes_by_name_and_parent(&self, name: &str, parent: i64) -> VfsResult<Vec<TreeNode>> {
        self.query_nodes(
            "SELECT * FROM tree_nodes WHERE name = ?1 AND parent = ?2",
            &[&name, &parent],
        )
    }

    pub fn nodes_by_content_and_parent(
        &self,
        content: &ContentId,
        parent: i64,
    ) -> VfsResult<Vec<TreeNode>> {
        self.query_nodes(
            "SELECT * FROM tree_nodes WHERE content = ?1 AND parent = ?2",
            &[&content.as_str(), &parent],
        )
    }

    /// Number of rows (tombstoned or not) still referencing `content`.
    pub fn reference_count(&self, content: &ContentId) -> VfsResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(id) FROM tree_nodes WHERE content = ?1",
            params![content.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Root-level published nodes (the pinned set).
    pub fn pins(&self) -> VfsResult<Vec<TreeNode>> {
        self.query_nodes(
            "SELECT * FROM tree_nodes
             WHERE parent = 0 AND deleting = 0 AND seeding = 1",
            &[],
        )
    }

    /// Ancestor chain of `id`, root-most first, ending with the node
    /// itself.
    pub fn ancestors(&self, id: i64) -> VfsResult<Vec<TreeNode>> {
        let mut path = Vec::new();
        let mut cursor = id;
        while cursor > 0 {
            match self.node(cursor)? {
                Some(node) => {
                    cursor = node.parent;
                    path.push(node);
                }
                None => break,
            }
        }
        path.reverse();
        Ok(path)
    }

    pub fn parent_of(&self, id: i64) -> VfsResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT parent FROM tree_nodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
        .map(|p| p.unwrap_or(0))
    }

    pub fn content_of(&self, id: i64) -> VfsResult<Option<ContentId>> {
        let conn = self.conn.lock().unwrap();
        let content: Option<Option<String>> = conn
            .query_row(
                "SELECT content FROM tree_nodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(content.flatten().map(ContentId::from_trusted))
    }

    fn execute(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> VfsResult<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(sql, args).map_err(db_err)
    }

    pub fn set_name(&self, id: i64, name: &str) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET name = ?1 WHERE id = ?2",
            &[&name, &id],
        )?;
        Ok(())
    }

    pub fn set_content(&self, id: i64, content: &ContentId) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET content = ?1 WHERE id = ?2",
            &[&content.as_str(), &id],
        )?;
        Ok(())
    }

    pub fn set_mime_type(&self, id: i64, mime_type: &str) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET mime_type = ?1 WHERE id = ?2",
            &[&mime_type, &id],
        )?;
        Ok(())
    }

    pub fn set_size(&self, id: i64, size: i64) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET size = ?1 WHERE id = ?2",
            &[&size, &id],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, id: i64, progress: i64) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET progress = ?1 WHERE id = ?2",
            &[&progress, &id],
        )?;
        Ok(())
    }

    pub fn set_source_uri(&self, id: i64, uri: &str) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET source_uri = ?1 WHERE id = ?2",
            &[&uri, &id],
        )?;
        Ok(())
    }

    pub fn set_last_modified(&self, id: i64, time: i64) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET last_modified = ?1 WHERE id = ?2",
            &[&time, &id],
        )?;
        Ok(())
    }

    pub fn set_job(&self, id: i64, job: &str) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET job = ?1 WHERE id = ?2",
            &[&job, &id],
        )?;
        Ok(())
    }

    pub fn reset_job(&self, id: i64) -> VfsResult<()> {
        self.execute("UPDATE tree_nodes SET job = NULL WHERE id = ?1", &[&id])?;
        Ok(())
    }

    pub fn job(&self, id: i64) -> VfsResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let job: Option<Option<String>> = conn
            .query_row(
                "SELECT job FROM tree_nodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(job.flatten())
    }

    /// Claim a node for a transfer; a no-op on tombstoned rows.
    pub fn set_leaching(&self, id: i64) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET leaching = 1 WHERE id = ?1 AND deleting = 0",
            &[&id],
        )?;
        Ok(())
    }

    pub fn reset_leaching(&self, id: i64) -> VfsResult<()> {
        self.execute("UPDATE tree_nodes SET leaching = 0 WHERE id = ?1", &[&id])?;
        Ok(())
    }

    pub fn is_leaching(&self, id: i64) -> VfsResult<bool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT leaching FROM tree_nodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
        .map(|v| v.unwrap_or(false))
    }

    pub fn is_init(&self, id: i64) -> VfsResult<bool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT init FROM tree_nodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
        .map(|v| v.unwrap_or(false))
    }

    pub fn reset_init(&self, id: i64) -> VfsResult<()> {
        self.execute("UPDATE tree_nodes SET init = 0 WHERE id = ?1", &[&id])?;
        Ok(())
    }

    /// Tombstone a node. Bumps `last_modified` so the reclamation pass
    /// can apply a grace interval.
    pub fn set_deleting(&self, id: i64) -> VfsResult<()> {
        self.execute(
            "UPDATE tree_nodes SET deleting = 1, last_modified = ?1 WHERE id = ?2",
            &[&unix_millis(), &id],
        )?;
        Ok(())
    }

    pub fn reset_deleting(&self, id: i64) -> VfsResult<()> {
        self.execute("UPDATE tree_nodes SET deleting = 0 WHERE id = ?1", &[&id])?;
        Ok(())
    }

    /// Terminal success transition: seeding, progress/init/leaching
    /// cleared, content updated when a new id was produced. Guarded so a
    /// concurrent delete wins.
    pub fn set_done(&self, id: i64, content: Option<&ContentId>) -> VfsResult<()> {
        match content {
            Some(cid) => self.execute(
                "UPDATE tree_nodes
                 SET content = ?1, seeding = 1, init = 0, progress = 0, leaching = 0
                 WHERE id = ?2 AND deleting = 0",
                &[&cid.as_str(), &id],
            )?,
            None => self.execute(
                "UPDATE tree_nodes
                 SET seeding = 1, init = 0, progress = 0, leaching = 0
                 WHERE id = ?1 AND deleting = 0",
                &[&id],
            )?,
        };
        Ok(())
    }

    /// Tombstoned rows whose last modification is no newer than `time`.
    pub fn tombstoned_before(&self, time: i64) -> VfsResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM tree_nodes
                 WHERE deleting = 1 AND last_modified <= ?1",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![time], |row| row.get(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    // ---------- name records ----------

    pub fn name_record(&self, peer: &PeerKey) -> VfsResult<Option<NameRecord>> {
        let conn = self.conn.lock().unwrap();
        // sqlite has no unsigned 64-bit affinity; the column is i64 and
        // converted at this boundary
        let row: Option<(Option<String>, i64)> = conn
            .query_row(
                "SELECT content, sequence FROM name_records WHERE peer = ?1",
                params![peer.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some((content, sequence)) => Ok(Some(NameRecord {
                peer: peer.clone(),
                content: content.map(ContentId::from_trusted),
                sequence: sequence as u64,
            })),
            None => Ok(None),
        }
    }

    /// Fetch the record for `peer`, creating an empty one if absent.
    pub fn ensure_name_record(&self, peer: &PeerKey) -> VfsResult<NameRecord> {
        if let Some(record) = self.name_record(peer)? {
            return Ok(record);
        }
        self.execute(
            "INSERT OR IGNORE INTO name_records (peer) VALUES (?1)",
            &[&peer.as_str()],
        )?;
        self.name_record(peer)?
            .ok_or_else(|| VfsError::DbError(format!("name record vanished for {}", peer)))
    }

    pub fn set_record_content(&self, peer: &PeerKey, content: &ContentId) -> VfsResult<()> {
        self.execute(
            "UPDATE name_records SET content = ?1 WHERE peer = ?2",
            &[&content.as_str(), &peer.as_str()],
        )?;
        Ok(())
    }

    /// Sequence numbers only move forward; a stale update is dropped.
    pub fn set_record_sequence(&self, peer: &PeerKey, sequence: u64) -> VfsResult<()> {
        let sequence = sequence as i64;
        let changed = self.execute(
            "UPDATE name_records SET sequence = ?1
             WHERE peer = ?2 AND sequence <= ?1",
            &[&sequence, &peer.as_str()],
        )?;
        if changed == 0 {
            warn!("dropping stale sequence {} for {}", sequence, peer);
        }
        Ok(())
    }

    // ---------- dns links ----------

    pub fn dns_link(&self, domain: &str) -> VfsResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT link FROM dns_links WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn store_dns_link(&self, domain: &str, link: &str) -> VfsResult<()> {
        self.execute(
            "INSERT OR REPLACE INTO dns_links (domain, link, updated)
             VALUES (?1, ?2, ?3)",
            &[&domain, &link, &unix_millis()],
        )?;
        Ok(())
    }

    // ---------- settings ----------

    pub fn setting(&self, key: &str) -> VfsResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> VfsResult<()> {
        self.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            &[&key, &value],
        )?;
        Ok(())
    }

    fn bool_setting(&self, key: &str, default: bool) -> VfsResult<bool> {
        Ok(self
            .setting(key)?
            .map(|v| v == "1")
            .unwrap_or(default))
    }

    pub fn sequence(&self) -> VfsResult<u64> {
        Ok(self
            .setting(SETTING_SEQUENCE)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(SEQUENCE_BASE))
    }

    pub fn set_sequence(&self, sequence: u64) -> VfsResult<()> {
        self.set_setting(SETTING_SEQUENCE, &sequence.to_string())
    }

    pub fn redirect_index(&self) -> VfsResult<bool> {
        self.bool_setting(SETTING_REDIRECT_INDEX, true)
    }

    pub fn set_redirect_index(&self, enabled: bool) -> VfsResult<()> {
        self.set_setting(SETTING_REDIRECT_INDEX, if enabled { "1" } else { "0" })
    }

    pub fn redirect_url(&self) -> VfsResult<bool> {
        self.bool_setting(SETTING_REDIRECT_URL, false)
    }

    pub fn set_redirect_url(&self, enabled: bool) -> VfsResult<()> {
        self.set_setting(SETTING_REDIRECT_URL, if enabled { "1" } else { "0" })
    }

    pub fn publisher_enabled(&self) -> VfsResult<bool> {
        self.bool_setting(SETTING_PUBLISHER_ENABLED, true)
    }

    pub fn set_publisher_enabled(&self, enabled: bool) -> VfsResult<()> {
        self.set_setting(SETTING_PUBLISHER_ENABLED, if enabled { "1" } else { "0" })
    }

    pub fn publish_interval_hours(&self) -> VfsResult<u64> {
        Ok(self
            .setting(SETTING_PUBLISH_INTERVAL)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(6))
    }

    pub fn set_publish_interval_hours(&self, hours: u64) -> VfsResult<()> {
        self.set_setting(SETTING_PUBLISH_INTERVAL, &hours.to_string())
    }
}
