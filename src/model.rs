use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct TableDump {
    pub source: Option<String>,
    pub pages: Vec<PageTables>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageTables {
    pub page: u32,
    pub tables: Vec<Vec<Vec<Option<String>>>>,
}

/// One validated row as it left the table walker. `periode` and `exigence`
/// come from the diploma cell's own lines; `diploma` is the carried-forward
/// program name active when the row was seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub diploma: Option<String>,
    pub university: String,
    pub speciality: Option<String>,
    pub code: String,
    pub bac: String,
    pub formula: String,
    pub score: Option<f64>,
    pub page: u32,
    pub periode: Option<String>,
    pub exigence: Option<String>,
}

/// Fully resolved program entry. `university` and `parent_university` carry
/// the unresolved sentinel rather than an empty string when no match exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub code: String,
    pub diploma: String,
    pub university: String,
    pub parent_university: String,
    pub speciality: String,
    pub bac_section: String,
    pub formula: String,
    pub min_score: f64,
    pub duration: String,
    pub requirements: Option<String>,
    pub source_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractPaths {
    pub cache_root: String,
    pub tables_path: String,
    pub records_path: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ExtractCounts {
    pub pages_seen: usize,
    pub pages_skipped_before_start: usize,
    pub tables_seen: usize,
    pub tables_skipped_short: usize,
    pub rows_seen: usize,
    pub preparatory_marker_rows: usize,
    pub header_rows_skipped: usize,
    pub rows_rejected_code: usize,
    pub rows_rejected_score: usize,
    pub records_emitted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub source: Option<String>,
    pub source_sha256: String,
    pub start_page: u32,
    pub paths: ExtractPaths,
    pub counts: ExtractCounts,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformPaths {
    pub cache_root: String,
    pub records_path: String,
    pub dataset_path: String,
    pub corpus_path: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TransformCounts {
    pub records_loaded: usize,
    pub duplicate_records_skipped: usize,
    pub incomplete_records_dropped: usize,
    pub music_override_codes: usize,
    pub records_emitted: usize,
    pub corpus_blocks_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub source_sha256: String,
    pub paths: TransformPaths,
    pub counts: TransformCounts,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}
