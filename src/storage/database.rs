//! PostgreSQL-backed `BuildStore` and `RepositoryStore` implementations.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;

use crate::build::model::{Build, BuildState, BuildType};
use crate::build::state::BuildStore;
use crate::chroot::{BaseMirror, Chroot};
use crate::error::{BuildStateError, RepositoryError};
use crate::repository::{RepoState, RepositoryStore, SourceRepository};

use super::migrations::MigrationRunner;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// PostgreSQL-backed storage for the orchestrator's entities. Implements
/// both `BuildStore` and `RepositoryStore` against the same pool; handlers
/// never see `sqlx` types directly.
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    async fn load_projectversions(&self, build_id: i64) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT pv.project_name, pv.version
            FROM build_projectversion bpv
            JOIN projectversion pv ON pv.id = bpv.projectversion_id
            WHERE bpv.build_id = $1
            "#,
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let project: String = row.get("project_name");
                let version: String = row.get("version");
                format!("{project}/{version}")
            })
            .collect())
    }

    fn row_to_build(row: &sqlx::postgres::PgRow) -> Result<Build, BuildStateError> {
        let buildtype_str: String = row.get("buildtype");
        let buildstate_str: String = row.get("buildstate");
        let buildtype = BuildType::from_str(&buildtype_str)
            .map_err(|_| BuildStateError::InvalidTransition { from: buildtype_str.clone(), to: "<parse>".to_string() })?;
        let buildstate = BuildState::from_str(&buildstate_str)
            .map_err(|_| BuildStateError::InvalidTransition { from: buildstate_str.clone(), to: "<parse>".to_string() })?;

        let createdstamp: DateTime<Utc> = row.get("createdstamp");
        let startstamp: Option<DateTime<Utc>> = row.get("startstamp");
        let buildendstamp: Option<DateTime<Utc>> = row.get("buildendstamp");
        let endstamp: Option<DateTime<Utc>> = row.get("endstamp");

        Ok(Build {
            id: row.get("id"),
            parent_id: row.get("parent_id"),
            buildtype,
            buildstate,
            createdstamp: createdstamp.with_timezone(&Local),
            startstamp: startstamp.map(|t| t.with_timezone(&Local)),
            buildendstamp: buildendstamp.map(|t| t.with_timezone(&Local)),
            endstamp: endstamp.map(|t| t.with_timezone(&Local)),
            version: row.get("version"),
            git_ref: row.get("git_ref"),
            ci_branch: row.get("ci_branch"),
            sourcename: row.get("sourcename"),
            architecture: row.get("architecture"),
            is_ci: row.get("is_ci"),
            builddeps: row.get("builddeps"),
            projectversions: Vec::new(),
            sourcerepository_id: row.get("sourcerepository_id"),
            projectversion_id: row.get("projectversion_id"),
            maintainer_id: row.get("maintainer_id"),
            buildtask_id: row.get("buildtask_id"),
        })
    }

    fn row_to_repository(row: &sqlx::postgres::PgRow) -> Result<SourceRepository, RepositoryError> {
        let state_str: String = row.get("state");
        let state = RepoState::from_str(&state_str).map_err(|_| RepositoryError::UrlParse(state_str.clone()))?;
        Ok(SourceRepository {
            id: row.get("id"),
            url: row.get("url"),
            name: row.get("name"),
            state,
        })
    }

    /// Whether `projectversion_id`'s `is_locked` flag is set, consulted by
    /// rebuild eligibility. A missing row is treated as unlocked.
    pub async fn is_locked(&self, projectversion_id: i64) -> Result<bool, DatabaseError> {
        let row = sqlx::query("SELECT is_locked FROM projectversion WHERE id = $1")
            .bind(projectversion_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("is_locked")).unwrap_or(false))
    }

    /// Generic key/value read, mirroring the upstream `metadata` table. The
    /// core itself does not depend on this; it exists so an HTTP admin
    /// surface built later has a contract to call into.
    pub async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_metadata(&self, key: &str, value: serde_json::Value) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BuildStore for Database {
    async fn get(&self, id: i64) -> Result<Build, BuildStateError> {
        let row = sqlx::query("SELECT * FROM build WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(id))?
            .ok_or(BuildStateError::NotFound(id))?;

        let mut build = Self::row_to_build(&row)?;
        build.projectversions = self.load_projectversions(id).await.unwrap_or_default();
        Ok(build)
    }

    async fn save(&self, build: &Build) -> Result<(), BuildStateError> {
        sqlx::query(
            r#"
            INSERT INTO build (
                id, parent_id, buildtype, buildstate, createdstamp, startstamp,
                buildendstamp, endstamp, version, git_ref, ci_branch, sourcename,
                architecture, is_ci, builddeps, sourcerepository_id,
                projectversion_id, maintainer_id, buildtask_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                parent_id = EXCLUDED.parent_id,
                buildtype = EXCLUDED.buildtype,
                buildstate = EXCLUDED.buildstate,
                startstamp = EXCLUDED.startstamp,
                buildendstamp = EXCLUDED.buildendstamp,
                endstamp = EXCLUDED.endstamp,
                version = EXCLUDED.version,
                git_ref = EXCLUDED.git_ref,
                ci_branch = EXCLUDED.ci_branch,
                sourcename = EXCLUDED.sourcename,
                architecture = EXCLUDED.architecture,
                is_ci = EXCLUDED.is_ci,
                builddeps = EXCLUDED.builddeps,
                sourcerepository_id = EXCLUDED.sourcerepository_id,
                projectversion_id = EXCLUDED.projectversion_id,
                maintainer_id = EXCLUDED.maintainer_id,
                buildtask_id = EXCLUDED.buildtask_id
            "#,
        )
        .bind(build.id)
        .bind(build.parent_id)
        .bind(build.buildtype.as_str())
        .bind(build.buildstate.as_str())
        .bind(build.createdstamp.with_timezone(&Utc))
        .bind(build.startstamp.map(|t| t.with_timezone(&Utc)))
        .bind(build.buildendstamp.map(|t| t.with_timezone(&Utc)))
        .bind(build.endstamp.map(|t| t.with_timezone(&Utc)))
        .bind(&build.version)
        .bind(&build.git_ref)
        .bind(&build.ci_branch)
        .bind(&build.sourcename)
        .bind(&build.architecture)
        .bind(build.is_ci)
        .bind(&build.builddeps)
        .bind(build.sourcerepository_id)
        .bind(build.projectversion_id)
        .bind(build.maintainer_id)
        .bind(build.buildtask_id)
        .execute(&self.pool)
        .await
        .map_err(|_| BuildStateError::NotFound(build.id))?;
        Ok(())
    }

    async fn parent(&self, build: &Build) -> Result<Option<Build>, BuildStateError> {
        let Some(parent_id) = build.parent_id else {
            return Ok(None);
        };
        match self.get(parent_id).await {
            Ok(build) => Ok(Some(build)),
            Err(BuildStateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn siblings(&self, build: &Build) -> Result<Vec<Build>, BuildStateError> {
        let Some(parent_id) = build.parent_id else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT * FROM build WHERE parent_id = $1 AND id != $2")
            .bind(parent_id)
            .bind(build.id)
            .fetch_all(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(build.id))?;

        rows.iter().map(Self::row_to_build).collect()
    }

    async fn maintainer(&self, build: &Build) -> Result<(Option<String>, Option<String>), BuildStateError> {
        let Some(maintainer_id) = build.maintainer_id else {
            return Ok((None, None));
        };
        let row = sqlx::query("SELECT name, email FROM maintainer WHERE id = $1")
            .bind(maintainer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(build.id))?;

        Ok(match row {
            Some(row) => (Some(row.get("name")), Some(row.get("email"))),
            None => (None, None),
        })
    }

    async fn needs_build_debs(&self) -> Result<Vec<Build>, BuildStateError> {
        let rows = sqlx::query("SELECT * FROM build WHERE buildtype = 'deb' AND buildstate = 'needs_build' ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(0))?;
        rows.iter().map(Self::row_to_build).collect()
    }

    async fn non_root_in_state(&self, state: BuildState) -> Result<Vec<Build>, BuildStateError> {
        let rows = sqlx::query("SELECT * FROM build WHERE buildtype != 'build' AND buildstate = $1 ORDER BY id")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(0))?;
        rows.iter().map(Self::row_to_build).collect()
    }

    async fn clear_buildtask(&self, build_id: i64) -> Result<(), BuildStateError> {
        sqlx::query("DELETE FROM buildtask WHERE build_id = $1")
            .bind(build_id)
            .execute(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(build_id))?;
        Ok(())
    }

    async fn is_projectversion_locked(&self, projectversion_id: Option<i64>) -> Result<bool, BuildStateError> {
        let Some(projectversion_id) = projectversion_id else {
            return Ok(false);
        };
        self.is_locked(projectversion_id)
            .await
            .map_err(|_| BuildStateError::NotFound(projectversion_id))
    }

    async fn chroot_for_build(&self, build_id: i64) -> Result<Option<Chroot>, BuildStateError> {
        let row = sqlx::query("SELECT * FROM chroot WHERE build_id = $1")
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| BuildStateError::NotFound(build_id))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let basemirror: serde_json::Value = row.get("basemirror");
        let basemirror: BaseMirror = serde_json::from_value(basemirror)
            .map_err(|_| BuildStateError::NotFound(build_id))?;
        Ok(Some(Chroot {
            id: row.get("id"),
            build_id: row.get("build_id"),
            architecture: row.get("architecture"),
            basemirror,
        }))
    }
}

#[async_trait]
impl RepositoryStore for Database {
    async fn get(&self, id: i64) -> Result<SourceRepository, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sourcerepository WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(id))?
            .ok_or(RepositoryError::NotFound(id))?;
        Self::row_to_repository(&row)
    }

    async fn save(&self, repo: &SourceRepository) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO sourcerepository (id, url, name, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                name = EXCLUDED.name,
                state = EXCLUDED.state
            "#,
        )
        .bind(repo.id)
        .bind(&repo.url)
        .bind(&repo.name)
        .bind(repo.state.as_str())
        .execute(&self.pool)
        .await
        .map_err(|_| RepositoryError::NotFound(repo.id))?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sourcerepository WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(id))?;
        Ok(())
    }

    async fn build_count(&self, repo_id: i64) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM build WHERE sourcerepository_id = $1")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(repo_id))?;
        Ok(row.get("count"))
    }

    async fn projectversion_attachment_count(&self, repo_id: i64) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sourcerepository_projectversion WHERE sourcerepository_id = $1")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(repo_id))?;
        Ok(row.get("count"))
    }

    async fn reassign_builds(&self, from_id: i64, to_id: i64) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE build SET sourcerepository_id = $1 WHERE sourcerepository_id = $2")
            .bind(to_id)
            .bind(from_id)
            .execute(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(from_id))?;
        Ok(())
    }

    async fn merge_projectversion_attachments(&self, keep_id: i64, dup_id: i64) -> Result<bool, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| RepositoryError::NotFound(dup_id))?;

        let dup_rows = sqlx::query("SELECT projectversion_id FROM sourcerepository_projectversion WHERE sourcerepository_id = $1")
            .bind(dup_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|_| RepositoryError::NotFound(dup_id))?;

        let mut no_conflicts = true;
        for row in dup_rows {
            let pv_id: i64 = row.get("projectversion_id");
            let keep_has_row: Option<(i64,)> = sqlx::query_as(
                "SELECT projectversion_id FROM sourcerepository_projectversion WHERE sourcerepository_id = $1 AND projectversion_id = $2",
            )
            .bind(keep_id)
            .bind(pv_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| RepositoryError::NotFound(keep_id))?;

            if keep_has_row.is_some() {
                sqlx::query("UPDATE sourcerepository_projectversion SET sourcerepository_id = $1 WHERE sourcerepository_id = $2 AND projectversion_id = $3")
                    .bind(keep_id)
                    .bind(dup_id)
                    .bind(pv_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|_| RepositoryError::NotFound(dup_id))?;
                no_conflicts = false;
            }
        }

        tx.commit().await.map_err(|_| RepositoryError::NotFound(dup_id))?;
        Ok(no_conflicts)
    }

    async fn list_with_null_name(&self) -> Result<Vec<SourceRepository>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM sourcerepository WHERE name IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(|_| RepositoryError::NotFound(0))?;
        rows.iter().map(Self::row_to_repository).collect()
    }
}
