use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lookup tables driving row classification and entity resolution. These are
/// data, not logic: a JSON file passed via --rules-path overrides any subset
/// of them, the rest fall back to the values tuned against the 2025 guide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub governorates: Vec<String>,
    pub institution_keywords: Vec<String>,
    pub header_keywords: Vec<String>,
    pub preparatory_markers: Vec<String>,
    pub requirement_keywords: Vec<String>,
    pub diploma_update_blockers: Vec<String>,
    pub bac_sections: HashMap<String, String>,
    pub amd_marker: String,
    pub compound_cycle_period: String,
    pub default_duration: String,
    pub nine_year_duration: String,
    pub section_placeholder: String,
    pub female_only_marker: String,
    pub midwifery_diploma: String,
    pub midwifery_speciality: String,
    pub medicine_keyword: String,
    pub medicine_diploma: String,
    pub music_keyword: String,
    pub music_diploma: String,
    pub unresolved: String,
}

impl Default for RuleSet {
    fn default() -> Self {
        let bac_sections = [
            ("علوم تجريبية", "علوم تجريبية"),
            ("علوم الإعلامية", "علوم إعلامية"),
            ("علوم اإلعالمية", "علوم إعلامية"),
            ("ةيملاعلإا مولع", "علوم إعلامية"),
            ("اقتصاد و تصرف", "اقتصاد وتصرف"),
            ("إقتصاد وتصرف", "اقتصاد وتصرف"),
            ("فرصتو داصتقإ", "اقتصاد وتصرف"),
            ("رياضيات", "رياضيات"),
            ("آداب", "آداب"),
            ("بادآ", "آداب"),
            ("علوم تقنية", "علوم تقنية"),
            ("العلوم التقنية", "علوم تقنية"),
            ("ةيبيرجت مولع", "علوم تجريبية"),
        ]
        .into_iter()
        .map(|(raw, canonical)| (raw.to_string(), canonical.to_string()))
        .collect();

        Self {
            governorates: to_strings(&[
                "تونس",
                "تونس المنار",
                "قرطاج",
                "منوبة",
                "جندوبة",
                "نابل",
                "سوسة",
                "صفاقس",
                "قابس",
                "قفصة",
                "المنستير",
                "القيروان",
                "سيدي بوزيد",
                "زغوان",
            ]),
            institution_keywords: to_strings(&[
                "معهد",
                "المعهد",
                "كلية",
                "الكلية",
                "المدرسة",
                "المدرسة العليا",
            ]),
            header_keywords: to_strings(&[
                "مجموع نقاط",
                "صيغة احتساب",
                "الشعبة",
                "المؤسسة",
                "الرمز",
                "الجامعة",
                "الشهادة",
            ]),
            preparatory_markers: to_strings(&[
                "مرحلة تحضيرية",
                "مندمجة",
                "فيزياء - كيمياء",
                "العلمية",
                "Préparatoire",
            ]),
            requirement_keywords: to_strings(&["اختبار", "إجبارية", "تطلب", "تربية بدنية"]),
            diploma_update_blockers: to_strings(&["إجبارية", "اختبار", "تطلب"]),
            bac_sections,
            amd_marker: "(امد)".to_string(),
            compound_cycle_period: "سنتان +3 سنوات".to_string(),
            default_duration: "3 سنوات".to_string(),
            nine_year_duration: "9 سنوات".to_string(),
            section_placeholder: "الشعبة".to_string(),
            female_only_marker: "خاص باإلناث".to_string(),
            midwifery_diploma: "الإجازة في علوم التوليد - قابلة".to_string(),
            midwifery_speciality: "علوم التوليد - قابلة".to_string(),
            medicine_keyword: "طب".to_string(),
            medicine_diploma: "الطب".to_string(),
            music_keyword: "موسيقى".to_string(),
            music_diploma: "الإجازة في الموسيقى والعلوم الموسيقية".to_string(),
            unresolved: "غير محدد".to_string(),
        }
    }
}

impl RuleSet {
    pub fn load(rules_path: Option<&Path>) -> Result<Self> {
        let Some(path) = rules_path else {
            return Ok(Self::default());
        };

        let raw =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[derive(Debug)]
pub struct Patterns {
    pub code: Regex,
    pub compound_cycle: Regex,
    pub duration: Regex,
    pub parent_university: Regex,
}

impl Patterns {
    pub fn new() -> Result<Self> {
        Ok(Self {
            code: Regex::new(r"^[0-9]{5}$").context("failed to compile code regex")?,
            compound_cycle: Regex::new(r"سن[تو]ان\s*\+\s*3")
                .context("failed to compile compound cycle regex")?,
            duration: Regex::new(r"([0-9]+)\s*سنوات?")
                .context("failed to compile duration regex")?,
            parent_university: Regex::new(r"جامعة\s+(\S+)")
                .context("failed to compile parent university regex")?,
        })
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
