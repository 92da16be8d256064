//! 文件存储的持久化后端
//!
//! MemoryBackend：进程内共享 Map，跨 actor 重启保留数据（测试与默认配置用）。
//! SqliteBackend：rusqlite 单表，按 (agent_id, path) 主键 upsert。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::store::StoreError;

/// 一次待落盘的变更
#[derive(Clone, Debug, PartialEq)]
pub enum FileChange {
    Upsert { path: String, content: String },
    Delete { path: String },
}

/// 持久化后端（同步接口，actor 通过 spawn_blocking 调用）
pub trait FileBackend: Send + Sync {
    fn load(&self, agent_id: &str) -> Result<HashMap<String, String>, StoreError>;

    fn persist(&self, agent_id: &str, changes: &[FileChange]) -> Result<(), StoreError>;
}

/// 内存后端
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    agents: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取某个 agent 已落盘的文件（测试断言用）
    pub fn snapshot(&self, agent_id: &str) -> HashMap<String, String> {
        self.agents
            .lock()
            .ok()
            .and_then(|a| a.get(agent_id).cloned())
            .unwrap_or_default()
    }
}

impl FileBackend for MemoryBackend {
    fn load(&self, agent_id: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.snapshot(agent_id))
    }

    fn persist(&self, agent_id: &str, changes: &[FileChange]) -> Result<(), StoreError> {
        let mut agents = self
            .agents
            .lock()
            .map_err(|_| StoreError::Backend("memory backend lock poisoned".into()))?;
        let files = agents.entry(agent_id.to_string()).or_default();
        for change in changes {
            match change {
                FileChange::Upsert { path, content } => {
                    files.insert(path.clone(), content.clone());
                }
                FileChange::Delete { path } => {
                    files.remove(path);
                }
            }
        }
        Ok(())
    }
}

/// SQLite 后端
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_files (
                agent_id TEXT NOT NULL,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (agent_id, path)
            )",
            [],
        )
        .map_err(backend_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn backend_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl FileBackend for SqliteBackend {
    fn load(&self, agent_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite lock poisoned".into()))?;
        let mut stmt = conn
            .prepare("SELECT path, content FROM agent_files WHERE agent_id = ?1")
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(backend_err)?;
        let mut files = HashMap::new();
        for row in rows {
            let (path, content) = row.map_err(backend_err)?;
            files.insert(path, content);
        }
        Ok(files)
    }

    /// 一批变更在同一事务中提交
    fn persist(&self, agent_id: &str, changes: &[FileChange]) -> Result<(), StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite lock poisoned".into()))?;
        let tx = conn.transaction().map_err(backend_err)?;
        let now = chrono::Utc::now().to_rfc3339();
        for change in changes {
            match change {
                FileChange::Upsert { path, content } => {
                    tx.execute(
                        "INSERT INTO agent_files (agent_id, path, content, updated_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(agent_id, path) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                        params![agent_id, path, content, now],
                    )
                    .map_err(backend_err)?;
                }
                FileChange::Delete { path } => {
                    tx.execute(
                        "DELETE FROM agent_files WHERE agent_id = ?1 AND path = ?2",
                        params![agent_id, path],
                    )
                    .map_err(backend_err)?;
                }
            }
        }
        tx.commit().map_err(backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        backend
            .persist(
                "a1",
                &[
                    FileChange::Upsert {
                        path: "notes.md".into(),
                        content: "v1".into(),
                    },
                    FileChange::Upsert {
                        path: "tmp.txt".into(),
                        content: "x".into(),
                    },
                    FileChange::Delete {
                        path: "tmp.txt".into(),
                    },
                ],
            )
            .unwrap();
        let files = backend.load("a1").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files["notes.md"], "v1");
        assert!(backend.load("other").unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_backend_persists_across_connections() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("files.db");
        {
            let backend = SqliteBackend::open(&db).unwrap();
            backend
                .persist(
                    "agent",
                    &[FileChange::Upsert {
                        path: "plan.md".into(),
                        content: "draft".into(),
                    }],
                )
                .unwrap();
            backend
                .persist(
                    "agent",
                    &[FileChange::Upsert {
                        path: "plan.md".into(),
                        content: "final".into(),
                    }],
                )
                .unwrap();
        }
        let backend = SqliteBackend::open(&db).unwrap();
        let files = backend.load("agent").unwrap();
        assert_eq!(files["plan.md"], "final");
    }

    #[test]
    fn test_sqlite_backend_delete() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .persist(
                "agent",
                &[FileChange::Upsert {
                    path: "a.txt".into(),
                    content: "1".into(),
                }],
            )
            .unwrap();
        backend
            .persist("agent", &[FileChange::Delete { path: "a.txt".into() }])
            .unwrap();
        assert!(backend.load("agent").unwrap().is_empty());
    }
}
