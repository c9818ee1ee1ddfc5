use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::ExtractArgs;
use crate::model::{
    ExtractCounts, ExtractPaths, ExtractRunManifest, PageTables, RawRecord, TableDump,
};
use crate::rules::{Patterns, RuleSet};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

const ROW_WIDTH: usize = 7;

pub fn run(args: ExtractArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let tables_path = args
        .tables_path
        .clone()
        .unwrap_or_else(|| cache_root.join("extracted").join("tables_raw.json"));
    let records_path = args
        .records_path
        .clone()
        .unwrap_or_else(|| cache_root.join("extracted").join("structured_scores.json"));
    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("extract_run_{}.json", utc_compact_string(started_ts)))
    });

    info!(cache_root = %cache_root.display(), run_id = %run_id, "starting extract");

    let rules = RuleSet::load(args.rules_path.as_deref())?;
    let patterns = Patterns::new()?;

    let raw = fs::read(&tables_path)
        .with_context(|| format!("failed to read {}", tables_path.display()))?;
    let dump: TableDump = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", tables_path.display()))?;
    let source_sha256 = sha256_file(&tables_path)?;

    let (records, counts) = extract_records(&dump.pages, args.start_page, &rules, &patterns);

    write_json_pretty(&records_path, &records)?;

    let mut warnings = Vec::new();
    if counts.records_emitted == 0 {
        let warning = format!(
            "no records extracted from {} (start page {})",
            tables_path.display(),
            args.start_page
        );
        warn!(warning = %warning, "extract produced an empty record set");
        warnings.push(warning);
    }

    let manifest = ExtractRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_extract_command(&args),
        source: dump.source.clone(),
        source_sha256,
        start_page: args.start_page,
        paths: ExtractPaths {
            cache_root: cache_root.display().to_string(),
            tables_path: tables_path.display().to_string(),
            records_path: records_path.display().to_string(),
        },
        counts,
        warnings,
        notes: vec![
            "Raw table dump is expected from the upstream PDF table extraction step.".to_string(),
            "Rows failing header, code, or score validation are counted and skipped, never fatal."
                .to_string(),
        ],
    };

    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %records_path.display(),
        records = manifest.counts.records_emitted,
        "wrote raw records"
    );
    info!(path = %manifest_path.display(), "wrote extract run manifest");

    Ok(())
}

/// Restores logical reading order for a cell whose script run was emitted in
/// visual order. Cells without Arabic-block characters pass through as-is.
pub fn repair_visual_order(text: &str) -> String {
    if text.chars().any(|ch| ('\u{0600}'..='\u{06FF}').contains(&ch)) {
        text.chars().rev().collect()
    } else {
        text.to_string()
    }
}

#[derive(Debug)]
struct AssembledRow {
    cells: [String; ROW_WIDTH],
    /// Diploma cell before glyph repair, kept line-structured for the
    /// period / requirement splitter.
    diploma_cell_raw: String,
}

#[derive(Debug, Default)]
struct WalkerState {
    previous: [String; ROW_WIDTH],
    current_diploma: String,
    current_preparatory: String,
}

/// Width-normalizes one raw row to the fixed column layout
/// [score, formula, bac, code, speciality, university, diploma], repairs
/// glyph order per cell, and fills empty cells down from the last value seen
/// at the same index (vertically merged source cells).
fn assemble_row(raw: &[Option<String>], state: &mut WalkerState) -> AssembledRow {
    let diploma_cell_raw = raw
        .get(ROW_WIDTH - 1)
        .and_then(|cell| cell.clone())
        .unwrap_or_default();

    let mut cells: [String; ROW_WIDTH] = std::array::from_fn(|_| String::new());
    for (index, slot) in cells.iter_mut().enumerate() {
        let text = raw
            .get(index)
            .and_then(|cell| cell.as_deref())
            .unwrap_or("")
            .trim();
        let repaired = repair_visual_order(text);

        if repaired.is_empty() {
            *slot = state.previous[index].clone();
        } else {
            state.previous[index] = repaired.clone();
            *slot = repaired;
        }
    }

    AssembledRow {
        cells,
        diploma_cell_raw,
    }
}

/// Splits the diploma cell's own lines into an explicit study period and the
/// concatenated admission requirements. The first duration-looking line wins;
/// requirement lines keep their source order.
fn split_diploma_cell(
    raw_cell: &str,
    rules: &RuleSet,
    patterns: &Patterns,
) -> (Option<String>, Option<String>) {
    let mut period = None;
    let mut requirements = Vec::new();

    for line in raw_cell.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let logical = repair_visual_order(line);
        if patterns.duration.is_match(&logical) || line.contains(&rules.amd_marker) {
            if period.is_none() {
                period = Some(logical);
            }
        } else if rules
            .requirement_keywords
            .iter()
            .any(|keyword| logical.contains(keyword.as_str()))
        {
            requirements.push(logical);
        }
    }

    let requirements = (!requirements.is_empty()).then(|| requirements.join("، "));
    (period, requirements)
}

fn walk_table(
    table: &[Vec<Option<String>>],
    page: u32,
    rules: &RuleSet,
    patterns: &Patterns,
    counts: &mut ExtractCounts,
    out: &mut Vec<RawRecord>,
) {
    counts.tables_seen += 1;
    if table.len() < 3 {
        counts.tables_skipped_short += 1;
        return;
    }

    let mut state = WalkerState::default();

    for raw_row in table {
        counts.rows_seen += 1;
        let row = assemble_row(raw_row, &mut state);
        let diploma_raw = row.cells[ROW_WIDTH - 1].clone();

        if rules
            .preparatory_markers
            .iter()
            .any(|marker| diploma_raw.contains(marker.as_str()))
        {
            state.current_preparatory = diploma_raw.trim().to_string();
            counts.preparatory_marker_rows += 1;
            continue;
        }

        if !diploma_raw.is_empty()
            && !patterns.compound_cycle.is_match(&diploma_raw)
            && !diploma_raw.contains(&rules.amd_marker)
            && !rules
                .diploma_update_blockers
                .iter()
                .any(|keyword| diploma_raw.contains(keyword.as_str()))
        {
            state.current_diploma = diploma_raw.trim().to_string();
        }

        let joined = row.cells.join(" ");
        if rules
            .header_keywords
            .iter()
            .any(|keyword| joined.contains(keyword.as_str()))
        {
            counts.header_rows_skipped += 1;
            continue;
        }

        let code = row.cells[3].trim();
        if !patterns.code.is_match(code) {
            counts.rows_rejected_code += 1;
            continue;
        }

        let score_text = row.cells[0].replace(',', ".");
        if score_text.is_empty() || score_text == "-" {
            counts.rows_rejected_score += 1;
            continue;
        }
        let Ok(score) = score_text.parse::<f64>() else {
            counts.rows_rejected_score += 1;
            continue;
        };

        let (cell_period, exigence) = split_diploma_cell(&row.diploma_cell_raw, rules, patterns);

        // A compound "two years + three" row inside an active preparatory
        // cycle belongs to that cycle, not to the carried diploma, and its
        // period is the fixed compound literal rather than the cell text.
        let (diploma, periode) = if !state.current_preparatory.is_empty()
            && patterns.compound_cycle.is_match(&diploma_raw)
        {
            (
                Some(state.current_preparatory.clone()),
                Some(rules.compound_cycle_period.clone()),
            )
        } else {
            let diploma =
                (!state.current_diploma.is_empty()).then(|| state.current_diploma.clone());
            (diploma, cell_period)
        };

        let university = collapse_whitespace(&row.cells[5].replace('\n', " "));
        let speciality_text = collapse_whitespace(&row.cells[4].replace('\n', " - "));
        let speciality = (!speciality_text.is_empty()).then_some(speciality_text);

        out.push(RawRecord {
            diploma,
            university,
            speciality,
            code: code.to_string(),
            bac: row.cells[2].clone(),
            formula: row.cells[1].clone(),
            score: Some(score),
            page,
            periode,
            exigence,
        });
        counts.records_emitted += 1;
    }
}

pub fn extract_records(
    pages: &[PageTables],
    start_page: u32,
    rules: &RuleSet,
    patterns: &Patterns,
) -> (Vec<RawRecord>, ExtractCounts) {
    let mut counts = ExtractCounts::default();
    let mut records = Vec::new();

    for page in pages {
        if page.page < start_page {
            counts.pages_skipped_before_start += 1;
            continue;
        }
        counts.pages_seen += 1;

        for table in &page.tables {
            walk_table(table, page.page, rules, patterns, &mut counts, &mut records);
        }
    }

    (records, counts)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_extract_command(args: &ExtractArgs) -> String {
    let mut command = vec![
        "tawjih".to_string(),
        "extract".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.tables_path {
        command.push("--tables-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.records_path {
        command.push("--records-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.manifest_path {
        command.push("--manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.rules_path {
        command.push("--rules-path".to_string());
        command.push(path.display().to_string());
    }
    command.push("--start-page".to_string());
    command.push(args.start_page.to_string());

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|value| Some(value.to_string())).collect()
    }

    /// Re-encodes logical Arabic text into the visual order the source table
    /// extractor emits, so walking it back through repair yields the input.
    fn visual(text: &str) -> String {
        text.chars().rev().collect()
    }

    fn data_row(score: &str, code: &str, diploma: &str) -> Vec<Option<String>> {
        cells(&[
            score,
            "FG",
            &visual("رياضيات"),
            code,
            &visual("إعلامية"),
            &visual("معهد الصحافة جامعة منوبة"),
            diploma,
        ])
    }

    fn header_row() -> Vec<Option<String>> {
        cells(&[
            &visual("مجموع نقاط"),
            &visual("صيغة احتساب"),
            &visual("الشعبة"),
            &visual("الرمز"),
            &visual("الشعبة"),
            &visual("المؤسسة"),
            &visual("الشهادة"),
        ])
    }

    #[test]
    fn repair_visual_order_reverses_arabic_runs() {
        assert_eq!(repair_visual_order("تايضاير"), "رياضيات");
        assert_eq!(repair_visual_order(&visual("علوم تجريبية")), "علوم تجريبية");
    }

    #[test]
    fn repair_visual_order_leaves_non_arabic_cells_untouched() {
        assert_eq!(repair_visual_order("12345"), "12345");
        assert_eq!(repair_visual_order("15,5"), "15,5");
        assert_eq!(repair_visual_order("FG + M"), "FG + M");
        assert_eq!(repair_visual_order(""), "");
    }

    #[test]
    fn assemble_row_pads_and_truncates_to_fixed_width() {
        let mut state = WalkerState::default();

        let empty = assemble_row(&[], &mut state);
        assert!(empty.cells.iter().all(|cell| cell.is_empty()));

        let short = assemble_row(&cells(&["10,5", "FG", "x"]), &mut state);
        assert_eq!(short.cells[0], "10,5");
        assert_eq!(short.cells[2], "x");
        assert_eq!(short.cells[6], "");

        let wide_values: Vec<&str> = (0..12).map(|_| "v").collect();
        let wide = assemble_row(&cells(&wide_values), &mut state);
        assert_eq!(wide.cells.len(), ROW_WIDTH);
        assert!(wide.cells.iter().all(|cell| cell == "v"));
    }

    #[test]
    fn assemble_row_fills_empty_cells_from_previous_row() {
        let mut state = WalkerState::default();

        assemble_row(&data_row("15,5", "12345", &visual("الإجازة في الصحافة")), &mut state);
        let second = assemble_row(
            &cells(&["14,2", "", "", "12346", "", "", ""]),
            &mut state,
        );

        assert_eq!(second.cells[0], "14,2");
        assert_eq!(second.cells[1], "FG");
        assert_eq!(second.cells[2], "رياضيات");
        assert_eq!(second.cells[3], "12346");
        assert_eq!(second.cells[5], "معهد الصحافة جامعة منوبة");
    }

    #[test]
    fn fill_down_never_crosses_a_table_boundary() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();

        let first_table = vec![
            header_row(),
            data_row("15,5", "12345", &visual("الإجازة في الصحافة")),
            data_row("14,0", "12346", ""),
        ];
        let diploma = visual("الإجازة في الآداب");
        let second_table = vec![
            cells(&["13,0", "FG", &visual("آداب"), "20111", "", &visual("كلية الآداب"), &diploma]),
            cells(&["12,5", "FG", &visual("آداب"), "20112", "", "", ""]),
            cells(&["12,0", "FG", &visual("آداب"), "20113", "", "", ""]),
        ];
        let pages = vec![PageTables {
            page: 40,
            tables: vec![first_table, second_table],
        }];

        let (records, _) = extract_records(&pages, 40, &rules, &patterns);

        assert_eq!(records.len(), 5);
        // Second table must not inherit the first table's speciality column.
        assert_eq!(records[2].speciality, None);
        assert_eq!(records[2].university, "كلية الآداب");
        // But fill-down still applies inside the second table.
        assert_eq!(records[3].university, "كلية الآداب");
        assert_eq!(records[4].university, "كلية الآداب");
    }

    #[test]
    fn walk_table_skips_header_rows_and_short_tables() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();
        let mut counts = ExtractCounts::default();
        let mut out = Vec::new();

        walk_table(
            &[header_row(), data_row("15,5", "12345", "")],
            40,
            &rules,
            &patterns,
            &mut counts,
            &mut out,
        );
        assert_eq!(counts.tables_skipped_short, 1);
        assert!(out.is_empty());

        let table = vec![
            header_row(),
            data_row("15,5", "12345", &visual("الإجازة في الصحافة")),
            data_row("14,0", "12346", ""),
        ];
        walk_table(&table, 40, &rules, &patterns, &mut counts, &mut out);

        assert_eq!(counts.header_rows_skipped, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, "12345");
        assert_eq!(out[0].bac, "رياضيات");
        assert_eq!(out[0].diploma.as_deref(), Some("الإجازة في الصحافة"));
    }

    #[test]
    fn walk_table_rejects_malformed_codes() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();
        let mut counts = ExtractCounts::default();
        let mut out = Vec::new();

        let table = vec![
            data_row("15,5", "1234", ""),
            data_row("15,5", "123456", ""),
            data_row("15,5", "12a45", ""),
        ];
        walk_table(&table, 40, &rules, &patterns, &mut counts, &mut out);

        assert!(out.is_empty());
        assert_eq!(counts.rows_rejected_code, 3);
    }

    #[test]
    fn walk_table_rejects_unparseable_scores_and_normalizes_commas() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();
        let mut counts = ExtractCounts::default();
        let mut out = Vec::new();

        let table = vec![
            data_row("-", "12345", ""),
            data_row("abc", "12346", ""),
            data_row("15,5", "12347", ""),
        ];
        walk_table(&table, 40, &rules, &patterns, &mut counts, &mut out);

        assert_eq!(counts.rows_rejected_score, 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, Some(15.5));
    }

    #[test]
    fn walk_table_routes_compound_rows_to_the_active_preparatory_cycle() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();
        let mut counts = ExtractCounts::default();
        let mut out = Vec::new();

        let marker = visual("مرحلة تحضيرية مندمجة في الهندسة");
        let compound = visual("سنتان + 3 سنوات");
        let table = vec![
            data_row("15,5", "-", &marker),
            data_row("15,5", "31111", &compound),
            data_row("14,8", "31112", &compound),
        ];
        walk_table(&table, 40, &rules, &patterns, &mut counts, &mut out);

        assert_eq!(counts.preparatory_marker_rows, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].diploma.as_deref(),
            Some("مرحلة تحضيرية مندمجة في الهندسة")
        );
        assert_eq!(out[0].periode.as_deref(), Some("سنتان +3 سنوات"));
        assert_eq!(out[1].diploma, out[0].diploma);
    }

    #[test]
    fn split_diploma_cell_separates_duration_and_requirement_lines() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();

        let cell = format!(
            "{}\n{}\n{}",
            visual("9 سنوات"),
            visual("اختبار في التربية البدنية"),
            visual("تطلب مقابلة")
        );
        let (period, requirements) = split_diploma_cell(&cell, &rules, &patterns);

        assert_eq!(period.as_deref(), Some("9 سنوات"));
        assert_eq!(
            requirements.as_deref(),
            Some("اختبار في التربية البدنية، تطلب مقابلة")
        );

        let (none_period, none_requirements) =
            split_diploma_cell(&visual("الإجازة في الصحافة"), &rules, &patterns);
        assert_eq!(none_period, None);
        assert_eq!(none_requirements, None);
    }

    #[test]
    fn extract_records_skips_pages_before_start_page() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();

        let table = vec![
            header_row(),
            data_row("15,5", "12345", ""),
            data_row("14,0", "12346", ""),
        ];
        let pages = vec![
            PageTables {
                page: 3,
                tables: vec![table.clone()],
            },
            PageTables {
                page: 40,
                tables: vec![table],
            },
        ];

        let (records, counts) = extract_records(&pages, 40, &rules, &patterns);

        assert_eq!(counts.pages_skipped_before_start, 1);
        assert_eq!(counts.pages_seen, 1);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.page == 40));
    }

    #[test]
    fn multi_line_university_and_speciality_cells_are_flattened() {
        let rules = RuleSet::default();
        let patterns = Patterns::new().unwrap();
        let mut counts = ExtractCounts::default();
        let mut out = Vec::new();

        // Whole-cell repair reverses across the newline, so feed the visual
        // form of the full cell, newline included.
        let university = visual("معهد الصحافة\nجامعة منوبة");
        let speciality = visual("إعلامية\nاتصال");
        let diploma = visual("الإجازة في الإعلامية");
        let table = vec![
            header_row(),
            cells(&["15,5", "FG", &visual("رياضيات"), "12345", &speciality, &university, &diploma]),
            data_row("14,0", "12346", ""),
        ];
        walk_table(&table, 40, &rules, &patterns, &mut counts, &mut out);

        assert_eq!(out[0].university, "معهد الصحافة جامعة منوبة");
        assert_eq!(out[0].speciality.as_deref(), Some("إعلامية - اتصال"));
    }
}
