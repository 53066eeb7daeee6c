//! SQLite-backed match store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;

use super::{
    AnalysisStage, CreateMatchRequest, DetectionStage, IngestionStage, Match, MatchError,
    MatchFilter, MatchStore, StageName, StageStatus,
};

const SELECT_COLUMNS: &str =
    "id, owner_id, created_at, updated_at, ingestion, detection, analysis";

fn scanned_column(stage: StageName) -> &'static str {
    match stage {
        StageName::Ingestion => "ingestion_scanned_at",
        StageName::Detection => "detection_scanned_at",
        StageName::Analysis => "analysis_scanned_at",
    }
}

/// Rows a pass of `stage` can advance.
///
/// Analysis waiting on a detection that will never complete is left out, so
/// it cannot crowd due rows out of the scan window.
fn due_condition(stage: StageName) -> &'static str {
    match stage {
        StageName::Ingestion => "ingestion_status = 'processing'",
        StageName::Detection => {
            "(ingestion_status = 'completed' AND detection_status IN ('not_started', 'processing'))"
        }
        StageName::Analysis => {
            "(analysis_status = 'processing' OR (analysis_status = 'pending' AND detection_status = 'completed'))"
        }
    }
}

/// SQLite-backed match store.
pub struct SqliteMatchStore {
    conn: Mutex<Connection>,
}

impl SqliteMatchStore {
    /// Create a new SQLite match store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, MatchError> {
        let conn = Connection::open(path).map_err(|e| MatchError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| MatchError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite match store (useful for testing).
    pub fn in_memory() -> Result<Self, MatchError> {
        let conn =
            Connection::open_in_memory().map_err(|e| MatchError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), MatchError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                ingestion_status TEXT NOT NULL,
                ingestion_job_id TEXT,
                ingestion TEXT NOT NULL,
                detection_status TEXT NOT NULL,
                detection TEXT NOT NULL,
                analysis_status TEXT NOT NULL,
                analysis TEXT NOT NULL,
                ingestion_scanned_at TEXT,
                detection_scanned_at TEXT,
                analysis_scanned_at TEXT
            );

            -- Every ingestion job a match was ever given, so late webhooks
            -- for replaced jobs still find their match.
            CREATE TABLE IF NOT EXISTS ingestion_jobs (
                job_id TEXT PRIMARY KEY,
                match_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_matches_owner_id ON matches(owner_id);
            CREATE INDEX IF NOT EXISTS idx_matches_ingestion_status ON matches(ingestion_status);
            CREATE INDEX IF NOT EXISTS idx_matches_ingestion_job_id ON matches(ingestion_job_id);
            CREATE INDEX IF NOT EXISTS idx_matches_detection_status ON matches(detection_status);
            CREATE INDEX IF NOT EXISTS idx_matches_analysis_status ON matches(analysis_status);
            "#,
        )
        .map_err(|e| MatchError::Database(e.to_string()))?;

        // Databases created before scan rotation and job history existed
        for stage in StageName::ALL {
            let _ = conn.execute(
                &format!("ALTER TABLE matches ADD COLUMN {} TEXT", scanned_column(stage)),
                [],
            );
        }
        conn.execute(
            "INSERT OR IGNORE INTO ingestion_jobs (job_id, match_id) SELECT ingestion_job_id, id FROM matches WHERE ingestion_job_id IS NOT NULL",
            [],
        )
        .map_err(|e| MatchError::Database(e.to_string()))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, MatchError> {
        self.conn
            .lock()
            .map_err(|_| MatchError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &MatchFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        for (column, statuses) in [
            ("ingestion_status", &filter.ingestion_status),
            ("detection_status", &filter.detection_status),
            ("analysis_status", &filter.analysis_status),
        ] {
            if statuses.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; statuses.len()].join(", ");
            conditions.push(format!("{} IN ({})", column, placeholders));
            for status in statuses {
                params.push(Box::new(status.as_str().to_string()));
            }
        }

        if let Some(stage) = filter.due_for {
            conditions.push(due_condition(stage).to_string());
        }

        if let Some(ref owner_id) = filter.owner_id {
            conditions.push("owner_id = ?".to_string());
            params.push(Box::new(owner_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn parse_json<T: DeserializeOwned>(idx: usize, json: &str) -> rusqlite::Result<T> {
        serde_json::from_str(json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    }

    fn row_to_match(row: &rusqlite::Row) -> rusqlite::Result<Match> {
        let created_at: String = row.get(2)?;
        let updated_at: String = row.get(3)?;
        let ingestion: String = row.get(4)?;
        let detection: String = row.get(5)?;
        let analysis: String = row.get(6)?;

        Ok(Match {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            created_at: Self::parse_timestamp(2, &created_at)?,
            updated_at: Self::parse_timestamp(3, &updated_at)?,
            ingestion: Self::parse_json(4, &ingestion)?,
            detection: Self::parse_json(5, &detection)?,
            analysis: Self::parse_json(6, &analysis)?,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Match>, MatchError> {
        let sql = format!("SELECT {} FROM matches WHERE id = ?", SELECT_COLUMNS);
        match conn.query_row(&sql, params![id], Self::row_to_match) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MatchError::Database(e.to_string())),
        }
    }

    /// Write one stage's status column and JSON record, leaving the other stages untouched.
    fn write_stage(
        &self,
        id: &str,
        stage: StageName,
        status: StageStatus,
        data_json: String,
        ingestion_job_id: Option<&str>,
    ) -> Result<Match, MatchError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();

        let changed = match stage {
            StageName::Ingestion => conn.execute(
                "UPDATE matches SET ingestion_status = ?, ingestion = ?, ingestion_job_id = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), data_json, ingestion_job_id, now, id],
            ),
            StageName::Detection => conn.execute(
                "UPDATE matches SET detection_status = ?, detection = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), data_json, now, id],
            ),
            StageName::Analysis => conn.execute(
                "UPDATE matches SET analysis_status = ?, analysis = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), data_json, now, id],
            ),
        }
        .map_err(|e| MatchError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(MatchError::NotFound(id.to_string()));
        }

        if let Some(job_id) = ingestion_job_id {
            conn.execute(
                "INSERT OR IGNORE INTO ingestion_jobs (job_id, match_id) VALUES (?, ?)",
                params![job_id, id],
            )
            .map_err(|e| MatchError::Database(e.to_string()))?;
        }

        Self::fetch(&conn, id)?.ok_or_else(|| MatchError::NotFound(id.to_string()))
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String, MatchError> {
        serde_json::to_string(value).map_err(|e| MatchError::Serialization(e.to_string()))
    }
}

impl MatchStore for SqliteMatchStore {
    fn create(&self, request: CreateMatchRequest) -> Result<Match, MatchError> {
        let conn = self.conn()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let ingestion = IngestionStage {
            source: request.source,
            ..Default::default()
        };
        let detection = DetectionStage::default();
        let analysis = AnalysisStage::default();

        conn.execute(
            "INSERT INTO matches (id, owner_id, created_at, updated_at, ingestion_status, ingestion_job_id, ingestion, detection_status, detection, analysis_status, analysis) VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
            params![
                id,
                request.owner_id,
                now.to_rfc3339(),
                now.to_rfc3339(),
                ingestion.progress.status.as_str(),
                Self::to_json(&ingestion)?,
                detection.progress.status.as_str(),
                Self::to_json(&detection)?,
                analysis.progress.status.as_str(),
                Self::to_json(&analysis)?,
            ],
        )
        .map_err(|e| MatchError::Database(e.to_string()))?;

        Ok(Match {
            id,
            owner_id: request.owner_id,
            created_at: now,
            ingestion,
            detection,
            analysis,
            updated_at: now,
        })
    }

    fn get(&self, id: &str) -> Result<Option<Match>, MatchError> {
        let conn = self.conn()?;
        Self::fetch(&conn, id)
    }

    fn find_by_ingestion_job(&self, job_id: &str) -> Result<Option<Match>, MatchError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM matches WHERE id = (SELECT match_id FROM ingestion_jobs WHERE job_id = ?)",
            SELECT_COLUMNS
        );
        match conn.query_row(&sql, params![job_id], Self::row_to_match) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MatchError::Database(e.to_string())),
        }
    }

    fn list(&self, filter: &MatchFilter) -> Result<Vec<Match>, MatchError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let order_by = match filter.due_for {
            // Never-scanned rows first, then least recently scanned.
            Some(stage) => format!(
                "{col} IS NOT NULL, {col} ASC, created_at ASC",
                col = scanned_column(stage)
            ),
            None => "created_at ASC".to_string(),
        };
        let sql = format!(
            "SELECT {} FROM matches {} ORDER BY {} LIMIT ? OFFSET ?",
            SELECT_COLUMNS, where_clause, order_by
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MatchError::Database(e.to_string()))?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_match)
            .map_err(|e| MatchError::Database(e.to_string()))?;

        let mut matches = Vec::new();
        for row_result in rows {
            matches.push(row_result.map_err(|e| MatchError::Database(e.to_string()))?);
        }

        Ok(matches)
    }

    fn mark_scanned(&self, stage: StageName, ids: &[String]) -> Result<(), MatchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let sql = format!(
            "UPDATE matches SET {} = ? WHERE id IN ({})",
            scanned_column(stage),
            vec!["?"; ids.len()].join(", ")
        );

        let mut all_params: Vec<&dyn rusqlite::ToSql> = vec![&now as &dyn rusqlite::ToSql];
        all_params.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));

        conn.execute(&sql, all_params.as_slice())
            .map_err(|e| MatchError::Database(e.to_string()))?;
        Ok(())
    }

    fn count(&self, filter: &MatchFilter) -> Result<i64, MatchError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM matches {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| MatchError::Database(e.to_string()))
    }

    fn update_ingestion(&self, id: &str, stage: &IngestionStage) -> Result<Match, MatchError> {
        self.write_stage(
            id,
            StageName::Ingestion,
            stage.progress.status,
            Self::to_json(stage)?,
            stage.progress.job_id.as_deref(),
        )
    }

    fn update_detection(&self, id: &str, stage: &DetectionStage) -> Result<Match, MatchError> {
        self.write_stage(
            id,
            StageName::Detection,
            stage.progress.status,
            Self::to_json(stage)?,
            None,
        )
    }

    fn update_analysis(&self, id: &str, stage: &AnalysisStage) -> Result<Match, MatchError> {
        self.write_stage(
            id,
            StageName::Analysis,
            stage.progress.status,
            Self::to_json(stage)?,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::{DetectedPlayer, SourceRef, StageProgress};

    fn create_test_store() -> SqliteMatchStore {
        SqliteMatchStore::in_memory().unwrap()
    }

    fn upload_request(owner: &str) -> CreateMatchRequest {
        CreateMatchRequest {
            owner_id: owner.to_string(),
            source: Some(SourceRef::Upload {
                object_key: "uploads/match.mp4".to_string(),
            }),
        }
    }

    fn processing_ingestion(job_id: &str) -> IngestionStage {
        IngestionStage {
            progress: StageProgress {
                status: StageStatus::Processing,
                job_id: Some(job_id.to_string()),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            source: Some(SourceRef::Upload {
                object_key: "uploads/match.mp4".to_string(),
            }),
            video_location: None,
        }
    }

    #[test]
    fn test_create_match() {
        let store = create_test_store();
        let created = store.create(upload_request("alice")).unwrap();

        assert!(!created.id.is_empty());
        assert_eq!(created.owner_id, "alice");
        assert_eq!(created.ingestion.progress.status, StageStatus::NotStarted);
        assert_eq!(created.detection.progress.status, StageStatus::NotStarted);
        assert_eq!(created.analysis.progress.status, StageStatus::NotStarted);
        assert!(created.ingestion.source.is_some());
    }

    #[test]
    fn test_get_match() {
        let store = create_test_store();
        let created = store.create(upload_request("alice")).unwrap();

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.ingestion, created.ingestion);
    }

    #[test]
    fn test_get_nonexistent_match() {
        let store = create_test_store();
        assert!(store.get("nonexistent-id").unwrap().is_none());
    }

    #[test]
    fn test_update_ingestion_persists_and_indexes_job() {
        let store = create_test_store();
        let created = store.create(upload_request("alice")).unwrap();

        let updated = store
            .update_ingestion(&created.id, &processing_ingestion("job-42"))
            .unwrap();
        assert_eq!(updated.ingestion.progress.status, StageStatus::Processing);

        let found = store.find_by_ingestion_job("job-42").unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(store.find_by_ingestion_job("job-unknown").unwrap().is_none());
    }

    #[test]
    fn test_stage_updates_do_not_clobber_each_other() {
        let store = create_test_store();
        let created = store.create(upload_request("alice")).unwrap();

        store
            .update_ingestion(&created.id, &processing_ingestion("job-1"))
            .unwrap();

        let detection = DetectionStage {
            progress: StageProgress {
                status: StageStatus::Completed,
                ..Default::default()
            },
            players: vec![DetectedPlayer {
                player_id: "p1".to_string(),
                label: None,
                confidence: Some(0.9),
            }],
        };
        let updated = store.update_detection(&created.id, &detection).unwrap();

        assert_eq!(updated.ingestion.progress.status, StageStatus::Processing);
        assert_eq!(updated.detection.players.len(), 1);
    }

    #[test]
    fn test_update_nonexistent_match() {
        let store = create_test_store();
        let result = store.update_detection("missing", &DetectionStage::default());
        assert!(matches!(result, Err(MatchError::NotFound(_))));
    }

    #[test]
    fn test_list_with_status_filters() {
        let store = create_test_store();
        let a = store.create(upload_request("alice")).unwrap();
        let _b = store.create(upload_request("bob")).unwrap();

        store
            .update_ingestion(&a.id, &processing_ingestion("job-a"))
            .unwrap();

        let processing = store
            .list(&MatchFilter::new().with_ingestion_status([StageStatus::Processing]))
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a.id);

        let either = store
            .list(&MatchFilter::new().with_ingestion_status([
                StageStatus::Processing,
                StageStatus::NotStarted,
            ]))
            .unwrap();
        assert_eq!(either.len(), 2);

        let combined = MatchFilter::new()
            .with_ingestion_status([StageStatus::NotStarted])
            .with_detection_status([StageStatus::NotStarted]);
        assert_eq!(store.count(&combined).unwrap(), 1);
    }

    #[test]
    fn test_list_with_owner_filter_and_pagination() {
        let store = create_test_store();
        for _ in 0..3 {
            store.create(upload_request("alice")).unwrap();
        }
        store.create(upload_request("bob")).unwrap();

        let alice = store.list(&MatchFilter::new().with_owner("alice")).unwrap();
        assert_eq!(alice.len(), 3);

        let page = store
            .list(&MatchFilter::new().with_limit(2).with_offset(2))
            .unwrap();
        assert_eq!(page.len(), 2);

        assert_eq!(store.count(&MatchFilter::new()).unwrap(), 4);
    }

    fn analysis_with(status: StageStatus) -> AnalysisStage {
        AnalysisStage {
            progress: StageProgress {
                status,
                ..Default::default()
            },
            assignments: Some(Vec::new()),
            artifact_ref: None,
        }
    }

    fn detection_with(status: StageStatus) -> DetectionStage {
        DetectionStage {
            progress: StageProgress {
                status,
                ..Default::default()
            },
            players: Vec::new(),
        }
    }

    #[test]
    fn test_due_analysis_skips_pending_without_detection() {
        let store = create_test_store();
        let stuck = store.create(upload_request("alice")).unwrap();
        let ready = store.create(upload_request("alice")).unwrap();
        let running = store.create(upload_request("alice")).unwrap();

        store
            .update_detection(&stuck.id, &detection_with(StageStatus::Failed))
            .unwrap();
        store
            .update_analysis(&stuck.id, &analysis_with(StageStatus::Pending))
            .unwrap();
        store
            .update_detection(&ready.id, &detection_with(StageStatus::Completed))
            .unwrap();
        store
            .update_analysis(&ready.id, &analysis_with(StageStatus::Pending))
            .unwrap();
        store
            .update_analysis(&running.id, &analysis_with(StageStatus::Processing))
            .unwrap();

        let due: Vec<String> = store
            .list(&MatchFilter::new().with_due(StageName::Analysis))
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(due, vec![ready.id, running.id]);
    }

    #[test]
    fn test_scanned_rows_move_to_back_of_scan() {
        let store = create_test_store();
        let ids: Vec<String> = (0..3)
            .map(|i| {
                let m = store.create(upload_request("alice")).unwrap();
                store
                    .update_ingestion(&m.id, &processing_ingestion(&format!("job-{}", i)))
                    .unwrap();
                m.id
            })
            .collect();
        let window = MatchFilter::new().with_due(StageName::Ingestion).with_limit(2);

        let first: Vec<String> = store.list(&window).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(first, ids[..2].to_vec());
        store.mark_scanned(StageName::Ingestion, &first).unwrap();

        let second: Vec<String> = store.list(&window).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(second[0], ids[2]);

        // Scans of other stages keep their own order.
        store
            .mark_scanned(StageName::Detection, &[ids[2].clone()])
            .unwrap();
        let again: Vec<String> = store.list(&window).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(again[0], ids[2]);
    }

    #[test]
    fn test_replaced_ingestion_job_still_finds_match() {
        let store = create_test_store();
        let created = store.create(upload_request("alice")).unwrap();

        store
            .update_ingestion(&created.id, &processing_ingestion("job-old"))
            .unwrap();
        store
            .update_ingestion(&created.id, &processing_ingestion("job-new"))
            .unwrap();

        let found = store.find_by_ingestion_job("job-old").unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.ingestion.progress.job_id.as_deref(), Some("job-new"));
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("matches.db");

        let store = SqliteMatchStore::new(&db_path).unwrap();
        let created = store.create(upload_request("alice")).unwrap();

        assert!(db_path.exists());
        assert!(store.get(&created.id).unwrap().is_some());
    }
}
