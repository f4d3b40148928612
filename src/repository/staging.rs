//! Staging item persistence: upserts, CAS status transitions, claims.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{parse_datetime, parse_datetime_opt, to_option, Result, Store};
use crate::models::{ProcessingStatus, Stage, StagingItem};

fn row_to_staging(row: &Row) -> rusqlite::Result<StagingItem> {
    Ok(StagingItem {
        id: row.get("id")?,
        external_id: row.get("external_id")?,
        status: ProcessingStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(ProcessingStatus::Pending),
        batch_id: row.get("batch_id")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        last_stage: row
            .get::<_, Option<String>>("last_stage")?
            .and_then(|s| Stage::from_str(&s)),
        error_message: row.get("error_message")?,
        pdf_url: row.get("pdf_url")?,
        pdf_url_hash: row.get("pdf_url_hash")?,
        grant_id: row.get("grant_id")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
        completed_at: parse_datetime_opt(row.get("completed_at")?),
    })
}

fn get_by_external_id(conn: &Connection, external_id: &str) -> Result<Option<StagingItem>> {
    to_option(conn.query_row(
        "SELECT * FROM staging_items WHERE external_id = ?",
        params![external_id],
        row_to_staging,
    ))
}

impl Store {
    /// Insert a staging item for an external id, or return the existing row.
    ///
    /// Existing terminal rows (`completed`/`failed`/`skipped`) come back
    /// unchanged so re-ingestion stays idempotent; a live row gets its PDF
    /// pointer and grant link refreshed. Returns `(item, inserted)`.
    pub fn upsert_staging(
        &self,
        external_id: &str,
        batch_id: Option<&str>,
        pdf_url: Option<&str>,
        grant_id: Option<i64>,
    ) -> Result<(StagingItem, bool)> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let pdf_url_hash = pdf_url.map(StagingItem::hash_pdf_url);

        if let Some(existing) = get_by_external_id(&conn, external_id)? {
            if existing.status.is_terminal() {
                return Ok((existing, false));
            }
            conn.execute(
                r#"
                UPDATE staging_items
                SET batch_id = COALESCE(?2, batch_id),
                    pdf_url = COALESCE(?3, pdf_url),
                    pdf_url_hash = COALESCE(?4, pdf_url_hash),
                    grant_id = COALESCE(?5, grant_id),
                    updated_at = ?6
                WHERE id = ?1
                "#,
                params![existing.id, batch_id, pdf_url, pdf_url_hash, grant_id, now],
            )?;
            let item = get_by_external_id(&conn, external_id)?
                .expect("row updated above must exist");
            return Ok((item, false));
        }

        conn.execute(
            r#"
            INSERT INTO staging_items
                (external_id, status, batch_id, retry_count, last_stage,
                 pdf_url, pdf_url_hash, grant_id, created_at, updated_at)
            VALUES (?1, 'pending', ?2, 0, 'fetch', ?3, ?4, ?5, ?6, ?6)
            "#,
            params![external_id, batch_id, pdf_url, pdf_url_hash, grant_id, now],
        )?;
        let item = get_by_external_id(&conn, external_id)?
            .expect("row inserted above must exist");
        Ok((item, true))
    }

    pub fn get_staging(&self, id: i64) -> Result<Option<StagingItem>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM staging_items WHERE id = ?",
            params![id],
            row_to_staging,
        ))
    }

    pub fn get_staging_by_external_id(&self, external_id: &str) -> Result<Option<StagingItem>> {
        let conn = self.connect()?;
        get_by_external_id(&conn, external_id)
    }

    /// Compare-and-set status transition. Succeeds only when the current
    /// status is one of `from`; this is what guarantees that at most one
    /// worker owns an item in `processing`.
    pub fn transition_status(
        &self,
        staging_id: i64,
        from: &[ProcessingStatus],
        to: ProcessingStatus,
        stage: Stage,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            let from_list = from
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let now = Utc::now().to_rfc3339();
            let completed_at = if to == ProcessingStatus::Completed {
                Some(now.clone())
            } else {
                None
            };
            // Completion clears any stale error message
            let error = if to == ProcessingStatus::Completed {
                None
            } else {
                error
            };
            let changed = conn.execute(
                &format!(
                    r#"
                    UPDATE staging_items
                    SET status = ?2,
                        last_stage = ?3,
                        error_message = COALESCE(?4, CASE WHEN ?2 = 'completed' THEN NULL ELSE error_message END),
                        completed_at = COALESCE(?5, completed_at),
                        updated_at = ?6
                    WHERE id = ?1 AND status IN ({from_list})
                    "#
                ),
                params![staging_id, to.as_str(), stage.as_str(), error, completed_at, now],
            )?;
            Ok(changed == 1)
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Atomically claim up to `limit` pending items for the pdf stage.
    pub fn claim_pending(&self, stage: Stage, limit: u32) -> Result<Vec<StagingItem>> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Vec<StagingItem>> = (|| {
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM staging_items
                WHERE status = 'pending'
                ORDER BY retry_count ASC, id ASC
                LIMIT ?1
                "#,
            )?;
            let items: Vec<StagingItem> = stmt
                .query_map(params![limit], row_to_staging)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let now = Utc::now().to_rfc3339();
            for item in &items {
                conn.execute(
                    "UPDATE staging_items SET status = 'processing', last_stage = ?2, updated_at = ?3 WHERE id = ?1",
                    params![item.id, stage.as_str(), now],
                )?;
            }

            Ok(items
                .into_iter()
                .map(|mut item| {
                    item.status = ProcessingStatus::Processing;
                    item.last_stage = Some(stage);
                    item
                })
                .collect())
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Record a failed attempt: bumps the retry counter and stores the
    /// error message. The caller decides whether to release the item back
    /// to `pending` (budget remains) or finalize it as `failed`.
    pub fn record_attempt_failure(&self, staging_id: i64, error: &str) -> Result<u32> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE staging_items SET retry_count = retry_count + 1, error_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![staging_id, error, now],
        )?;
        let count: i64 = conn.query_row(
            "SELECT retry_count FROM staging_items WHERE id = ?",
            params![staging_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Release items stuck in `processing` longer than the hard deadline
    /// back to `pending`. Acknowledgement is late, so a crashed worker's
    /// item becomes redeliverable; its retry budget is untouched because
    /// the previous attempt never completed. Returns how many were
    /// released.
    pub fn release_stale_processing(&self, older_than: chrono::Duration) -> Result<usize> {
        let conn = self.connect()?;
        let now = Utc::now();
        let cutoff = (now - older_than).to_rfc3339();
        let changed = conn.execute(
            r#"
            UPDATE staging_items
            SET status = 'pending', updated_at = ?2
            WHERE status = 'processing' AND updated_at < ?1
            "#,
            params![cutoff, now.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Record which stage last touched an item without changing its status.
    pub fn touch_stage(&self, staging_id: i64, stage: Stage) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE staging_items SET last_stage = ?2, updated_at = ?3 WHERE id = ?1",
            params![staging_id, stage.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Human-driven requeue: move a terminal item back to `pending` with a
    /// fresh retry budget. Returns false when the item is not terminal.
    pub fn requeue(&self, external_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            r#"
            UPDATE staging_items
            SET status = 'pending', retry_count = 0, error_message = NULL,
                completed_at = NULL, updated_at = ?2
            WHERE external_id = ?1 AND status IN ('completed', 'failed', 'skipped')
            "#,
            params![external_id, now],
        )?;
        Ok(changed == 1)
    }

    /// Requeue every failed item. Returns how many were reset.
    pub fn requeue_failed(&self) -> Result<usize> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            r#"
            UPDATE staging_items
            SET status = 'pending', retry_count = 0, error_message = NULL, updated_at = ?1
            WHERE status = 'failed'
            "#,
            params![now],
        )?;
        Ok(changed)
    }

    /// Counts of staging items by status.
    pub fn staging_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM staging_items GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Failed items with their error messages, for the stats surface.
    pub fn failed_items(&self, limit: u32) -> Result<Vec<StagingItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM staging_items WHERE status = 'failed' ORDER BY updated_at DESC LIMIT ?",
        )?;
        let items = stmt
            .query_map(params![limit], row_to_staging)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_store;
    use crate::models::{ProcessingStatus, Stage};

    #[test]
    fn test_upsert_staging_is_idempotent() {
        let (_dir, store) = temp_store();

        let (first, inserted) = store
            .upsert_staging("872189", Some("b1"), Some("https://x/doc.pdf"), None)
            .unwrap();
        assert!(inserted);
        assert_eq!(first.status, ProcessingStatus::Pending);
        assert_eq!(first.last_stage, Some(Stage::Fetch));
        assert!(first.pdf_url_hash.is_some());

        let (second, inserted) = store
            .upsert_staging("872189", Some("b2"), None, None)
            .unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        // pdf_url survives a refresh that carries no new URL
        assert_eq!(second.pdf_url.as_deref(), Some("https://x/doc.pdf"));
    }

    #[test]
    fn test_upsert_staging_terminal_unchanged() {
        let (_dir, store) = temp_store();
        let (item, _) = store.upsert_staging("1", None, None, None).unwrap();
        assert!(store
            .transition_status(
                item.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Skipped,
                Stage::Pdf,
                Some("No PDF URL"),
            )
            .unwrap());

        let (again, inserted) = store
            .upsert_staging("1", Some("b9"), Some("https://late/url.pdf"), None)
            .unwrap();
        assert!(!inserted);
        assert_eq!(again.status, ProcessingStatus::Skipped);
        assert_eq!(again.pdf_url, None);
    }

    #[test]
    fn test_cas_transition_claims_once() {
        let (_dir, store) = temp_store();
        let (item, _) = store.upsert_staging("2", None, None, None).unwrap();

        let claimed = store
            .transition_status(
                item.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Processing,
                Stage::Pdf,
                None,
            )
            .unwrap();
        assert!(claimed);

        // A second claim must lose the race
        let claimed_again = store
            .transition_status(
                item.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Processing,
                Stage::Pdf,
                None,
            )
            .unwrap();
        assert!(!claimed_again);
    }

    #[test]
    fn test_completion_clears_error() {
        let (_dir, store) = temp_store();
        let (item, _) = store.upsert_staging("3", None, None, None).unwrap();
        store.record_attempt_failure(item.id, "boom").unwrap();
        store
            .transition_status(
                item.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Completed,
                Stage::Pdf,
                None,
            )
            .unwrap();
        let item = store.get_staging(item.id).unwrap().unwrap();
        assert_eq!(item.status, ProcessingStatus::Completed);
        assert_eq!(item.error_message, None);
        assert!(item.completed_at.is_some());
    }

    #[test]
    fn test_claim_pending_batch() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store
                .upsert_staging(&format!("item-{i}"), None, Some("https://x/d.pdf"), None)
                .unwrap();
        }

        let claimed = store.claim_pending(Stage::Pdf, 3).unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed
            .iter()
            .all(|i| i.status == ProcessingStatus::Processing));

        // Remaining pool shrinks accordingly
        let claimed = store.claim_pending(Stage::Pdf, 10).unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[test]
    fn test_requeue_resets_retry_count() {
        let (_dir, store) = temp_store();
        let (item, _) = store.upsert_staging("4", None, None, None).unwrap();
        store.record_attempt_failure(item.id, "network down").unwrap();
        store
            .transition_status(
                item.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Failed,
                Stage::Pdf,
                Some("network down"),
            )
            .unwrap();

        assert!(store.requeue("4").unwrap());
        let item = store.get_staging(item.id).unwrap().unwrap();
        assert_eq!(item.status, ProcessingStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.error_message, None);

        // Requeue of a non-terminal item is a no-op
        assert!(!store.requeue("4").unwrap());
    }

    #[test]
    fn test_release_stale_processing() {
        let (_dir, store) = temp_store();
        let (item, _) = store
            .upsert_staging("stale", None, Some("https://x/d.pdf"), None)
            .unwrap();
        store.claim_pending(Stage::Pdf, 1).unwrap();

        // A fresh claim is not stale
        assert_eq!(
            store
                .release_stale_processing(chrono::Duration::minutes(10))
                .unwrap(),
            0
        );

        // Backdate the claim past the deadline
        let conn = store.connect().unwrap();
        let old = (chrono::Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
        conn.execute(
            "UPDATE staging_items SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![old, item.id],
        )
        .unwrap();

        assert_eq!(
            store
                .release_stale_processing(chrono::Duration::minutes(10))
                .unwrap(),
            1
        );
        let item = store.get_staging(item.id).unwrap().unwrap();
        assert_eq!(item.status, ProcessingStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_staging_counts() {
        let (_dir, store) = temp_store();
        store.upsert_staging("a", None, None, None).unwrap();
        store.upsert_staging("b", None, None, None).unwrap();
        let counts = store.staging_counts().unwrap();
        assert_eq!(counts, vec![("pending".to_string(), 2)]);
    }
}
