//! Query engine.
//!
//! Text or image query → embedding → vector top-K → record hydration →
//! post-filters → ranked page. When the encoders are not loaded, text
//! search degrades to a case-insensitive filename match and image search
//! reports service-unavailable.

pub mod datefilter;

use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::clip::EmbeddingService;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::store::{keys, Database, ImageRecord};

/// Default semantic similarity cutoff when no threshold is configured.
const DEFAULT_MIN_SCORE: f64 = 0.24;
/// Reserved tag mapped onto the favorite column.
pub const FAVORITE_TAG: &str = "__sys_favorite__";

/// Post-scoring filters, as sent by the HTTP client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilters {
    pub min_score: Option<f64>,
    pub folder_path: Option<String>,
    /// Inclusive day bounds, `YYYY-MM-DD`.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// One hydrated search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultItem {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub thumb_url: String,
    pub score: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: i64,
    pub last_modified: Option<String>,
    pub indexed_at: Option<String>,
    pub extra_json: Option<String>,
    pub status: String,
    pub favorite: bool,
    pub blurred: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub struct SearchService {
    db: Arc<Database>,
    embedder: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
}

impl SearchService {
    pub fn new(db: Arc<Database>, embedder: Arc<EmbeddingService>, index: Arc<VectorIndex>) -> Self {
        Self {
            db,
            embedder,
            index,
        }
    }

    /// Semantic text search, falling back to filename search while the
    /// encoders are not loaded.
    pub fn search_by_text(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResultItem>> {
        if !self.embedder.is_ready() {
            tracing::warn!("Encoders not ready — falling back to filename search");
            return self.fallback_filename_search(query, filters, limit, offset);
        }
        let Some(query_embedding) = self.embedder.embed_text(query) else {
            return self.fallback_filename_search(query, filters, limit, offset);
        };
        self.run_vector_search(&query_embedding, filters, limit, offset)
    }

    /// Visual similarity search from an uploaded image. Unlike the text
    /// path this has no fallback: missing encoders are a 503.
    pub fn search_by_image(
        &self,
        image_path: &Path,
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResultItem>> {
        if !self.embedder.is_ready() {
            return Err(Error::NotReady(
                "Encoder models are not loaded. Please download models first.".to_string(),
            ));
        }
        let query_embedding = self.embedder.embed_image(image_path).ok_or_else(|| {
            Error::InvalidInput("Could not process the uploaded image.".to_string())
        })?;
        self.run_vector_search(&query_embedding, filters, limit, offset)
    }

    /// Top-K scoring plus hydration and post-filtering, preserving hit
    /// order. Over-fetches to leave room for the filters.
    pub(crate) fn run_vector_search(
        &self,
        query_embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResultItem>> {
        let mut filters = filters.clone();
        if filters.min_score.is_none() {
            // The stored threshold applies to both text and visual search.
            filters.min_score = Some(self.configured_threshold());
        }

        let overfetch = (limit * 4).max(100).min(2000);
        let hits = self.index.top_k(query_embedding, overfetch, offset);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = hits.iter().map(|h| h.image_id).collect();
        let records = self.db.find_by_ids(&ids)?;
        let by_id: std::collections::HashMap<i64, ImageRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();

        let mut results = Vec::with_capacity(limit);
        for hit in hits {
            let Some(record) = by_id.get(&hit.image_id) else {
                continue;
            };
            if !passes_filters(record, hit.score, &filters) {
                continue;
            }
            results.push(to_result_item(record, hit.score));
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Filename-substring fallback. An empty query pages the most recently
    /// indexed records.
    pub fn fallback_filename_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResultItem>> {
        if query.trim().is_empty() {
            let records = self.db.find_recent(limit, offset)?;
            return Ok(records
                .iter()
                .filter(|r| passes_filters(r, 0.0, filters))
                .map(|r| to_result_item(r, 0.0))
                .collect());
        }

        let records = self.db.find_by_filename_substring(query.trim())?;
        Ok(records
            .iter()
            .filter(|r| passes_filters(r, 0.5, filters))
            .skip(offset)
            .take(limit)
            .map(|r| to_result_item(r, 0.5))
            .collect())
    }

    /// Tag search straight from the durable store; the reserved favorite
    /// tag reads the boolean column instead of the JSON blob.
    pub fn search_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<SearchResultItem>> {
        let records = if tag == FAVORITE_TAG {
            self.db.find_favorites(limit)?
        } else {
            self.db.find_by_tag_substring(tag, limit)?
        };
        Ok(records.iter().map(|r| to_result_item(r, 1.0)).collect())
    }

    /// Folder browsing: substring match on the stored path.
    pub fn browse_folder(&self, folder: &str, limit: usize) -> Result<Vec<SearchResultItem>> {
        let records = self.db.find_by_folder_substring(folder, limit)?;
        Ok(records.iter().map(|r| to_result_item(r, 0.0)).collect())
    }

    fn configured_threshold(&self) -> f64 {
        self.db
            .get_setting(keys::SEARCH_THRESHOLD)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIN_SCORE)
    }
}

/// Applies min-score, folder, date-range, and tag filters to a hydrated
/// record.
fn passes_filters(record: &ImageRecord, score: f64, filters: &SearchFilters) -> bool {
    if let Some(min_score) = filters.min_score {
        if score < min_score {
            return false;
        }
    }

    if let Some(folder) = filters.folder_path.as_deref() {
        if !folder.is_empty() && !record.file_path.contains(folder) {
            return false;
        }
    }

    // Date bounds compare against last-modified; records without one pass.
    if let Some(modified) = record.last_modified {
        if let Some(from) = parse_day_bound(filters.date_from.as_deref(), false) {
            if modified < from {
                return false;
            }
        }
        if let Some(to) = parse_day_bound(filters.date_to.as_deref(), true) {
            if modified > to {
                return false;
            }
        }
    }

    if let Some(tags) = filters.tags.as_ref().filter(|t| !t.is_empty()) {
        let wants_favorite = tags.iter().any(|t| t == FAVORITE_TAG);
        if wants_favorite {
            if !record.is_favorite {
                return false;
            }
            // Favorite as the only requested tag skips the blob check.
            if tags.len() == 1 {
                return true;
            }
        }

        let record_tags = record_tags(record);
        for required in tags {
            if required == FAVORITE_TAG {
                continue;
            }
            let found = record_tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case(required));
            if !found {
                return false;
            }
        }
    }

    true
}

/// `YYYY-MM-DD` → start-of-day or end-of-day timestamp.
fn parse_day_bound(value: Option<&str>, end_of_day: bool) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(value?.trim(), "%Y-%m-%d").ok()?;
    if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
}

/// Tags array out of the opaque JSON blob.
fn record_tags(record: &ImageRecord) -> Vec<String> {
    record
        .extra_json
        .as_deref()
        .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
        .and_then(|v| {
            v.get("tags").and_then(|t| {
                t.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect()
                })
            })
        })
        .unwrap_or_default()
}

pub(crate) fn to_result_item(record: &ImageRecord, score: f64) -> SearchResultItem {
    SearchResultItem {
        id: record.id,
        file_path: record.file_path.clone(),
        file_name: Path::new(&record.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        thumb_url: format!("/api/images/{}/thumb", record.id),
        score: (score * 10_000.0).round() / 10_000.0,
        width: record.width,
        height: record.height,
        file_size: record.file_size,
        last_modified: record.last_modified.map(crate::store::fmt_ts),
        indexed_at: record.indexed_at.map(crate::store::fmt_ts),
        extra_json: record.extra_json.clone(),
        status: record.status.as_str().to_string(),
        favorite: record.is_favorite,
        blurred: record.is_blurred,
        latitude: record.latitude,
        longitude: record.longitude,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStatus;
    use crate::vecmath::{l2_normalize, vector_to_bytes};

    fn setup(tmp: &Path) -> (Arc<Database>, Arc<VectorIndex>, SearchService) {
        let db = Arc::new(Database::open(&tmp.join("t.db")).unwrap());
        let index = Arc::new(VectorIndex::new());
        let svc = SearchService::new(
            Arc::clone(&db),
            Arc::new(EmbeddingService::new()),
            Arc::clone(&index),
        );
        (db, index, svc)
    }

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let mut v = vec![x, y];
        l2_normalize(&mut v);
        v
    }

    fn save_record(db: &Database, path: &str, vec: Option<&[f32]>) -> ImageRecord {
        let mut rec = ImageRecord::new(path.to_string());
        rec.status = RecordStatus::Indexed;
        rec.file_size = 10;
        rec.last_modified = crate::store::parse_ts("2024-06-01T12:00:00");
        rec.indexed_at = Some(chrono::Local::now().naive_local());
        rec.embedding = vec.map(vector_to_bytes);
        db.save(rec).unwrap()
    }

    #[test]
    fn test_vector_search_hydrates_in_rank_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, index, svc) = setup(tmp.path());

        let close = unit(1.0, 0.0);
        let mid = unit(0.8, 0.6);
        let far = unit(0.0, 1.0);
        let a = save_record(&db, "/p/close.jpg", Some(&close));
        let b = save_record(&db, "/p/mid.jpg", Some(&mid));
        let c = save_record(&db, "/p/far.jpg", Some(&far));
        index.upsert(a.id, close.clone());
        index.upsert(b.id, mid);
        index.upsert(c.id, far);

        let results = svc
            .run_vector_search(&close, &SearchFilters::default(), 10, 0)
            .unwrap();
        // far.jpg scores 0.0 < default 0.24 cutoff.
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file_path, "/p/close.jpg");
        assert_eq!(results[1].file_path, "/p/mid.jpg");
        assert!(results[0].score >= results[1].score);
        assert!((results[0].score - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_min_score_override_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, index, svc) = setup(tmp.path());
        let q = unit(1.0, 0.0);
        for i in 0..5 {
            let v = unit(1.0, i as f32 * 0.1);
            let rec = save_record(&db, &format!("/p/{}.jpg", i), Some(&v));
            index.upsert(rec.id, v);
        }

        let filters = SearchFilters {
            min_score: Some(0.0),
            ..Default::default()
        };
        let results = svc.run_vector_search(&q, &filters, 3, 0).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_filters_folder_date_and_tags() {
        let mut rec = ImageRecord::new("/photos/2024/trip/beach.jpg".to_string());
        rec.last_modified = crate::store::parse_ts("2024-06-15T10:30:00");
        rec.extra_json = Some(r#"{"tags":["Vacation","Beach"]}"#.to_string());
        rec.is_favorite = true;

        let mut f = SearchFilters {
            folder_path: Some("/photos/2024".to_string()),
            ..Default::default()
        };
        assert!(passes_filters(&rec, 1.0, &f));
        f.folder_path = Some("/other".to_string());
        assert!(!passes_filters(&rec, 1.0, &f));

        let f = SearchFilters {
            date_from: Some("2024-06-15".to_string()),
            date_to: Some("2024-06-15".to_string()),
            ..Default::default()
        };
        assert!(passes_filters(&rec, 1.0, &f), "inclusive day bounds");
        let f = SearchFilters {
            date_to: Some("2024-06-14".to_string()),
            ..Default::default()
        };
        assert!(!passes_filters(&rec, 1.0, &f));

        // Tags are case-insensitive and all required.
        let f = SearchFilters {
            tags: Some(vec!["vacation".to_string()]),
            ..Default::default()
        };
        assert!(passes_filters(&rec, 1.0, &f));
        let f = SearchFilters {
            tags: Some(vec!["vacation".to_string(), "skiing".to_string()]),
            ..Default::default()
        };
        assert!(!passes_filters(&rec, 1.0, &f));

        // The reserved favorite tag alone checks only the column.
        let f = SearchFilters {
            tags: Some(vec![FAVORITE_TAG.to_string()]),
            ..Default::default()
        };
        assert!(passes_filters(&rec, 1.0, &f));
        let mut not_fav = rec.clone();
        not_fav.is_favorite = false;
        assert!(!passes_filters(&not_fav, 1.0, &f));
    }

    #[test]
    fn test_text_search_falls_back_without_models() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, _index, svc) = setup(tmp.path());
        save_record(&db, "/p/Beach_day.jpg", None);
        save_record(&db, "/p/mountain.jpg", None);

        let results = svc
            .search_by_text("beach", &SearchFilters::default(), 10, 0)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "Beach_day.jpg");
        assert_eq!(results[0].score, 0.5);

        // Empty query pages recent records.
        let all = svc
            .search_by_text("", &SearchFilters::default(), 50, 0)
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_image_search_requires_models() {
        let tmp = tempfile::tempdir().unwrap();
        let (_db, _index, svc) = setup(tmp.path());
        let err = svc
            .search_by_image(Path::new("/q.jpg"), &SearchFilters::default(), 10, 0)
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[test]
    fn test_tag_search_and_favorites() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, _index, svc) = setup(tmp.path());
        let mut rec = ImageRecord::new("/p/a.jpg".to_string());
        rec.extra_json = Some(r#"{"tags":["vacation"]}"#.to_string());
        rec.is_favorite = true;
        db.save(rec).unwrap();
        save_record(&db, "/p/b.jpg", None);

        assert_eq!(svc.search_by_tag("vacation", 10).unwrap().len(), 1);
        assert_eq!(svc.search_by_tag(FAVORITE_TAG, 10).unwrap().len(), 1);
        assert_eq!(svc.search_by_tag("absent", 10).unwrap().len(), 0);
        assert_eq!(svc.browse_folder("/p", 10).unwrap().len(), 2);
    }
}
