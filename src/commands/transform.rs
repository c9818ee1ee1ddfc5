use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::TransformArgs;
use crate::model::{
    CanonicalRecord, RawRecord, TransformCounts, TransformPaths, TransformRunManifest,
};
use crate::rules::{Patterns, RuleSet};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
    write_text,
};

const NO_REQUIREMENTS: &str = "لا يوجد";
const BLOCK_MARKER: &str = "###";

pub fn run(args: TransformArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let records_path = args
        .records_path
        .clone()
        .unwrap_or_else(|| cache_root.join("extracted").join("structured_scores.json"));
    let dataset_path = args
        .dataset_path
        .clone()
        .unwrap_or_else(|| cache_root.join("processed").join("processed_scores.json"));
    let corpus_path = args
        .corpus_path
        .clone()
        .unwrap_or_else(|| cache_root.join("processed").join("rag_corpus.txt"));
    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "transform_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });

    info!(cache_root = %cache_root.display(), run_id = %run_id, "starting transform");

    let rules = RuleSet::load(args.rules_path.as_deref())?;
    let patterns = Patterns::new()?;

    let raw = fs::read(&records_path)
        .with_context(|| format!("failed to read {}", records_path.display()))?;
    let records: Vec<RawRecord> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", records_path.display()))?;
    let source_sha256 = sha256_file(&records_path)?;

    let (dataset, mut counts) = transform_records(&records, &rules, &patterns);
    let corpus = render_corpus(&dataset);
    counts.corpus_blocks_written = dataset.len();

    write_json_pretty(&dataset_path, &dataset)?;
    write_text(&corpus_path, &corpus)?;

    let mut warnings = Vec::new();
    if counts.records_emitted == 0 {
        let warning = format!("no canonical records produced from {}", records_path.display());
        warn!(warning = %warning, "transform produced an empty dataset");
        warnings.push(warning);
    }

    let manifest = TransformRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_transform_command(&args),
        source_sha256,
        paths: TransformPaths {
            cache_root: cache_root.display().to_string(),
            records_path: records_path.display().to_string(),
            dataset_path: dataset_path.display().to_string(),
            corpus_path: corpus_path.display().to_string(),
        },
        counts,
        warnings,
        notes: vec![
            "Dataset is deduplicated on (code, bac_section), first occurrence wins, sorted by code."
                .to_string(),
            "Corpus blocks are rendered after the sort so block order matches dataset order."
                .to_string(),
        ],
    };

    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %dataset_path.display(),
        records = manifest.counts.records_emitted,
        "wrote canonical dataset"
    );
    info!(
        path = %corpus_path.display(),
        blocks = manifest.counts.corpus_blocks_written,
        "wrote retrieval corpus"
    );
    info!(path = %manifest_path.display(), "wrote transform run manifest");

    Ok(())
}

pub fn transform_records(
    records: &[RawRecord],
    rules: &RuleSet,
    patterns: &Patterns,
) -> (Vec<CanonicalRecord>, TransformCounts) {
    let mut counts = TransformCounts {
        records_loaded: records.len(),
        ..TransformCounts::default()
    };

    let music_codes = collect_music_codes(records, rules);
    counts.music_override_codes = music_codes.len();

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for record in records {
        let key = (record.code.clone(), clean_bac(&record.bac, rules));
        if !seen.insert(key) {
            counts.duplicate_records_skipped += 1;
            continue;
        }

        match resolve_record(record, &music_codes, rules, patterns) {
            Some(canonical) => resolved.push(canonical),
            None => counts.incomplete_records_dropped += 1,
        }
    }

    resolved.sort_by(|a, b| a.code.cmp(&b.code));
    counts.records_emitted = resolved.len();

    (resolved, counts)
}

/// First pass over the whole batch: any code attached to a music speciality
/// anywhere forces the music program label on every record sharing that
/// code, even when the row's own speciality text differs.
fn collect_music_codes(records: &[RawRecord], rules: &RuleSet) -> HashSet<String> {
    records
        .iter()
        .filter(|record| {
            normalize_text(record.speciality.as_deref().unwrap_or(""))
                .contains(&rules.music_keyword)
        })
        .map(|record| record.code.clone())
        .collect()
}

fn resolve_record(
    record: &RawRecord,
    music_codes: &HashSet<String>,
    rules: &RuleSet,
    patterns: &Patterns,
) -> Option<CanonicalRecord> {
    let code = record.code.trim().to_string();
    if code.is_empty() {
        return None;
    }
    let score = record.score?;

    let diploma_raw = normalize_text(record.diploma.as_deref().unwrap_or(""));
    let speciality_raw = normalize_text(record.speciality.as_deref().unwrap_or(""));
    let periode_raw = normalize_text(record.periode.as_deref().unwrap_or(""));
    let requirements_raw = normalize_text(record.exigence.as_deref().unwrap_or(""));

    let duration = resolve_duration(
        &periode_raw,
        &diploma_raw,
        &requirements_raw,
        rules,
        patterns,
    );

    let (diploma, speciality) = apply_program_overrides(
        &code,
        &diploma_raw,
        &speciality_raw,
        &duration,
        music_codes,
        rules,
        patterns,
    );

    let (university, parent_university) = resolve_university(&record.university, rules, patterns);

    let formula = record.formula.trim();
    let formula = if formula.is_empty() {
        rules.unresolved.clone()
    } else {
        formula.to_string()
    };

    Some(CanonicalRecord {
        code,
        diploma,
        university,
        parent_university,
        speciality,
        bac_section: clean_bac(&record.bac, rules),
        formula,
        min_score: round_to_millis(score),
        duration,
        requirements: (!requirements_raw.is_empty()).then_some(requirements_raw),
        source_page: record.page,
    })
}

/// Duration precedence: explicit period column, then the diploma cell text,
/// then the requirement text, then the three-year baseline. First match wins.
fn resolve_duration(
    periode_raw: &str,
    diploma_raw: &str,
    requirements_raw: &str,
    rules: &RuleSet,
    patterns: &Patterns,
) -> String {
    extract_duration(periode_raw, patterns)
        .or_else(|| extract_duration(diploma_raw, patterns))
        .or_else(|| extract_duration(requirements_raw, patterns))
        .unwrap_or_else(|| rules.default_duration.clone())
}

pub fn extract_duration(text: &str, patterns: &Patterns) -> Option<String> {
    patterns
        .duration
        .captures(text)
        .map(|captures| format!("{} سنوات", &captures[1]))
}

/// Program override rules, evaluated in fixed order; a later match replaces
/// the outcome of an earlier one.
fn apply_program_overrides(
    code: &str,
    diploma_raw: &str,
    speciality_raw: &str,
    duration: &str,
    music_codes: &HashSet<String>,
    rules: &RuleSet,
    patterns: &Patterns,
) -> (String, String) {
    // 1. Base label: the diploma cell text, unless it is empty, a column
    //    label leaking through, or only a duration expression.
    let mut diploma = if diploma_raw.is_empty()
        || diploma_raw.contains(&rules.section_placeholder)
        || diploma_raw.contains('/')
        || extract_duration(diploma_raw, patterns).is_some()
    {
        rules.unresolved.clone()
    } else {
        diploma_raw.to_string()
    };

    let mut speciality = if speciality_raw.is_empty() {
        rules.unresolved.clone()
    } else {
        collapse_whitespace(&speciality_raw.replace('-', " - "))
    };

    // 2. Female-only rows are the midwifery program regardless of label.
    if diploma_raw.contains(&rules.female_only_marker) {
        diploma = rules.midwifery_diploma.clone();
        speciality = rules.midwifery_speciality.clone();
    }

    // 3. A nine-year track or a medicine speciality wins over the cell text.
    if duration == rules.nine_year_duration || speciality_raw.contains(&rules.medicine_keyword) {
        diploma = rules.medicine_diploma.clone();
    }

    // 4. Batch-wide music override, computed by collect_music_codes.
    if music_codes.contains(code) {
        diploma = rules.music_diploma.clone();
    }

    (diploma, speciality)
}

/// Repairs the reversed-governorate artifact: a governorate name leading the
/// institution phrase is relocated to the tail as "جامعة <governorate>".
fn fix_reversed_institution(text: &str, rules: &RuleSet) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some((first, rest)) = tokens.split_first() else {
        return text.to_string();
    };

    if !rules.governorates.iter().any(|name| name == first) {
        return text.to_string();
    }

    for (index, token) in rest.iter().enumerate() {
        if rules
            .institution_keywords
            .iter()
            .any(|keyword| token.starts_with(keyword.as_str()))
        {
            let institution = rest[index..].join(" ");
            return format!("{institution} جامعة {first}");
        }
    }

    text.to_string()
}

/// Derives the institution and its parent university from the raw column
/// text. Both fall back to the unresolved sentinel, never to an empty string.
fn resolve_university(
    university_raw: &str,
    rules: &RuleSet,
    patterns: &Patterns,
) -> (String, String) {
    let text = fix_reversed_institution(&normalize_text(university_raw), rules);

    if text.is_empty() {
        return (rules.unresolved.clone(), rules.unresolved.clone());
    }

    let mut parent = patterns
        .parent_university
        .captures(&text)
        .map(|captures| format!("جامعة {}", &captures[1]));

    let mut institution = rules
        .institution_keywords
        .iter()
        .find_map(|keyword| text.find(keyword.as_str()).map(|at| text[at..].to_string()));

    if parent.is_none() {
        parent = rules
            .governorates
            .iter()
            .find(|name| text.contains(name.as_str()))
            .map(|name| format!("جامعة {name}"));
    }

    if let (Some(institution), Some(parent)) = (institution.as_mut(), parent.as_deref()) {
        *institution = institution.replace(parent, "").trim().to_string();
    }

    (
        institution
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| rules.unresolved.clone()),
        parent.unwrap_or_else(|| rules.unresolved.clone()),
    )
}

pub fn clean_bac(bac: &str, rules: &RuleSet) -> String {
    let trimmed = bac.trim();
    if trimmed.is_empty() {
        return rules.unresolved.clone();
    }

    rules
        .bac_sections
        .get(trimmed)
        .cloned()
        .unwrap_or_else(|| trimmed.to_string())
}

fn normalize_text(text: &str) -> String {
    let without_parens: String = text
        .chars()
        .map(|ch| if ch == '(' || ch == ')' { ' ' } else { ch })
        .collect();
    collapse_whitespace(&without_parens)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn round_to_millis(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn build_corpus_block(record: &CanonicalRecord) -> String {
    format!(
        "{BLOCK_MARKER}\n\
         التكوين: {}\n\
         الاختصاص: {}\n\
         المؤسسة: {}\n\
         الجامعة: {}\n\
         شعبة الباكالوريا: {}\n\
         المدة: {}\n\
         معدل القبول الأدنى: {}\n\
         صيغة الاحتساب: {}\n\
         شروط إضافية: {}\n",
        record.diploma,
        record.speciality,
        record.university,
        record.parent_university,
        record.bac_section,
        record.duration,
        record.min_score,
        record.formula,
        record.requirements.as_deref().unwrap_or(NO_REQUIREMENTS),
    )
}

pub fn render_corpus(records: &[CanonicalRecord]) -> String {
    records
        .iter()
        .map(build_corpus_block)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_transform_command(args: &TransformArgs) -> String {
    let mut command = vec![
        "tawjih".to_string(),
        "transform".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.records_path {
        command.push("--records-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.dataset_path {
        command.push("--dataset-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.corpus_path {
        command.push("--corpus-path".to_string());
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

    command.join(" ")
}
