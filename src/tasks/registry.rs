use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::ScheduledTask;
use crate::storage::Pool;

const TASK_COLUMNS: &str =
    "name, schedule, executor_id, catch_up_on_startup, max_catch_up_age_secs, enabled";

/// Task definitions persisted in SQLite.
#[derive(Clone)]
pub struct TaskRegistry {
    pool: Pool,
}

impl TaskRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Add a new task. The task is validated first; names are unique.
    pub async fn add(&self, task: &ScheduledTask) -> Result<()> {
        task.validate()?;

        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO tasks (name, schedule, executor_id, catch_up_on_startup, max_catch_up_age_secs, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.name,
                task.schedule.trim(),
                task.executor_id,
                task.catch_up_on_startup,
                max_age_to_sql(task.max_catch_up_age_secs)?,
                task.enabled,
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                anyhow::bail!("Task '{}' already exists", task.name)
            }
            Err(e) => Err(e).context("Failed to insert task"),
        }
    }

    /// Replace an existing task's definition (re-schedule).
    pub async fn update(&self, task: &ScheduledTask) -> Result<()> {
        task.validate()?;

        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE tasks
                 SET schedule = ?2, executor_id = ?3, catch_up_on_startup = ?4,
                     max_catch_up_age_secs = ?5, enabled = ?6, updated_at = datetime('now')
                 WHERE name = ?1",
                params![
                    task.name,
                    task.schedule.trim(),
                    task.executor_id,
                    task.catch_up_on_startup,
                    max_age_to_sql(task.max_catch_up_age_secs)?,
                    task.enabled,
                ],
            )
            .context("Failed to update task")?;
        if changed == 0 {
            anyhow::bail!("Task '{}' not found", task.name);
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.pool.get()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?1"),
                params![name],
                row_to_task,
            )
            .optional()
            .with_context(|| format!("Failed to load task '{name}'"))?;
        Ok(task)
    }

    /// All tasks, ordered by name.
    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY name"))?;

        let rows = stmt.query_map([], row_to_task)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tasks SET enabled = ?2, updated_at = datetime('now') WHERE name = ?1",
            params![name, enabled],
        )?;
        if changed == 0 {
            anyhow::bail!("Task '{}' not found", name);
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM tasks WHERE name = ?1", params![name])?;
        if changed == 0 {
            anyhow::bail!("Task '{}' not found", name);
        }
        Ok(())
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let max_age: Option<i64> = row.get(4)?;
    Ok(ScheduledTask {
        name: row.get(0)?,
        schedule: row.get(1)?,
        executor_id: row.get(2)?,
        catch_up_on_startup: row.get(3)?,
        max_catch_up_age_secs: max_age.and_then(|v| u64::try_from(v).ok()),
        enabled: row.get(5)?,
    })
}

fn max_age_to_sql(max_age: Option<u64>) -> Result<Option<i64>> {
    max_age
        .map(|v| i64::try_from(v).context("max catch-up age is too large"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn registry() -> (tempfile::TempDir, TaskRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("tasks.db")).unwrap();
        (dir, TaskRegistry::new(pool))
    }

    #[tokio::test]
    async fn test_add_get_list() {
        let (_dir, registry) = registry();
        let task = ScheduledTask::new("nightly", "0 3 * * *", "report-agent")
            .with_catch_up(Some(7200))
            .enabled(true);
        registry.add(&task).await.unwrap();
        registry
            .add(&ScheduledTask::new("alpha", "*/5 * * * *", "probe"))
            .await
            .unwrap();

        assert_eq!(registry.get("nightly").await.unwrap(), Some(task));
        assert_eq!(registry.get("missing").await.unwrap(), None);

        let names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["alpha", "nightly"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_tasks_rejected() {
        let (_dir, registry) = registry();
        let task = ScheduledTask::new("dup", "0 * * * *", "x");
        registry.add(&task).await.unwrap();

        let err = registry.add(&task).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let invalid = ScheduledTask::new("bad", "whenever", "x");
        assert!(registry.add(&invalid).await.is_err());
        assert_eq!(registry.get("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_enable_remove() {
        let (_dir, registry) = registry();
        let mut task = ScheduledTask::new("sync", "0 * * * *", "x");
        registry.add(&task).await.unwrap();

        task.schedule = "30 2 * * *".to_string();
        task.catch_up_on_startup = true;
        registry.update(&task).await.unwrap();
        registry.set_enabled("sync", true).await.unwrap();

        let stored = registry.get("sync").await.unwrap().unwrap();
        assert_eq!(stored.schedule, "30 2 * * *");
        assert!(stored.catch_up_on_startup);
        assert!(stored.enabled);

        registry.remove("sync").await.unwrap();
        assert!(registry.remove("sync").await.is_err());
        assert!(registry.set_enabled("sync", false).await.is_err());
    }
}
