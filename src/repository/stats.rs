//! Pipeline and search statistics for the operator surface.

use serde::Serialize;

use super::{Result, Store};

/// Vector index readiness summary.
#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub total_embeddings: i64,
    pub avg_dimensions: f64,
    /// True when at least one embedding is searchable.
    pub search_ready: bool,
}

/// Counts by entity and by staging status.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub staging_by_status: Vec<(String, i64)>,
    pub grants: i64,
    pub extractions: i64,
    pub extraction_errors: i64,
    pub embeddings: i64,
    pub search: SearchStats,
}

impl Store {
    pub fn search_stats(&self) -> Result<SearchStats> {
        let conn = self.connect()?;
        let total_embeddings: i64 =
            conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        let avg_dimensions: f64 = conn.query_row(
            "SELECT COALESCE(AVG(dimensions), 0) FROM embeddings",
            [],
            |row| row.get(0),
        )?;
        Ok(SearchStats {
            total_embeddings,
            avg_dimensions,
            search_ready: total_embeddings > 0,
        })
    }

    pub fn pipeline_stats(&self) -> Result<PipelineStats> {
        let conn = self.connect()?;
        let grants: i64 = conn.query_row("SELECT COUNT(*) FROM grants", [], |row| row.get(0))?;
        drop(conn);
        Ok(PipelineStats {
            staging_by_status: self.staging_counts()?,
            grants,
            extractions: self.count_extractions()?,
            extraction_errors: self.count_extraction_errors()?,
            embeddings: self.count_embeddings()?,
            search: self.search_stats()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_store;

    #[test]
    fn test_stats_on_empty_store() {
        let (_dir, store) = temp_store();
        let stats = store.pipeline_stats().unwrap();
        assert_eq!(stats.grants, 0);
        assert_eq!(stats.embeddings, 0);
        assert!(!stats.search.search_ready);
        assert!(stats.staging_by_status.is_empty());
    }
}
