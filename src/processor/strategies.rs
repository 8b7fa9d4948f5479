//! Built-in strategies: text, code, data and mixed content

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ChunkProcessor, NextAction, ProcessingContext, ProcessingStrategy, StrategyOutput};
use crate::error::{PipelineError, Result};
use crate::swarm::analysis::{self, cached_regex, ContentType};

/// Type-specific analysis object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Analysis {
    Text(TextAnalysis),
    Code(CodeAnalysis),
    Data(DataAnalysis),
    Mixed(MixedAnalysis),
}

fn push_unique(out: &mut Vec<String>, value: String) {
    if !value.is_empty() && !out.contains(&value) {
        out.push(value);
    }
}

/// Multi-word capitalized phrases, acronyms, years and percentages
pub fn extract_entities(text: &str) -> Vec<String> {
    static PHRASE: OnceLock<Option<Regex>> = OnceLock::new();
    static ACRONYM: OnceLock<Option<Regex>> = OnceLock::new();
    static YEAR: OnceLock<Option<Regex>> = OnceLock::new();
    static PERCENT: OnceLock<Option<Regex>> = OnceLock::new();

    let patterns = [
        cached_regex(&PHRASE, r"\b[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)+\b"),
        cached_regex(&ACRONYM, r"\b[A-Z]{2,}[0-9]*\b"),
        cached_regex(&YEAR, r"\b(?:1[5-9]\d{2}|20\d{2})\b"),
        cached_regex(&PERCENT, r"\b\d+(?:\.\d+)?%"),
    ];

    let mut entities = Vec::new();
    for re in patterns.into_iter().flatten() {
        for m in re.find_iter(text) {
            push_unique(&mut entities, m.as_str().to_string());
        }
    }
    entities
}

// ============================================================================
// Text
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextAnalysis {
    pub sentence_count: usize,
    pub word_count: usize,
    pub avg_sentence_length: f64,
    /// Flesch reading ease, clamped to 0..=100
    pub readability: f64,
    /// -1 (negative) ..= 1 (positive)
    pub sentiment: f64,
    pub sentiment_label: String,
    pub topics: Vec<String>,
    pub questions: usize,
}

const POSITIVE: &[&str] = &[
    "benefit", "best", "effective", "efficient", "excellent", "gain", "good", "great", "growth",
    "improve", "improved", "improvement", "positive", "robust", "strong", "success", "successful",
];

const NEGATIVE: &[&str] = &[
    "bad", "concern", "decline", "error", "fail", "failed", "failure", "issue", "loss", "negative",
    "poor", "problem", "risk", "weak", "worse", "worst",
];

fn syllables(word: &str) -> usize {
    let mut count = 0;
    let mut prev_vowel = false;
    for c in word.chars() {
        let vowel = matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if word.ends_with('e') && count > 1 {
        count -= 1;
    }
    count.max(1)
}

fn readability(words: &[String], sentences: usize) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let syllable_total: usize = words.iter().map(|w| syllables(w)).sum();
    let wps = words.len() as f64 / sentences.max(1) as f64;
    let spw = syllable_total as f64 / words.len() as f64;
    (206.835 - 1.015 * wps - 84.6 * spw).clamp(0.0, 100.0)
}

fn sentiment(words: &[String]) -> f64 {
    let pos = words.iter().filter(|w| POSITIVE.contains(&w.as_str())).count();
    let neg = words.iter().filter(|w| NEGATIVE.contains(&w.as_str())).count();
    if pos + neg == 0 {
        return 0.0;
    }
    (pos as f64 - neg as f64) / (pos + neg) as f64
}

/// First sentence mentioning each of the top keywords
fn key_sentences(sentences: &[&str], keywords: &[String], limit: usize) -> Vec<String> {
    let mut points = Vec::new();
    for keyword in keywords {
        if points.len() >= limit {
            break;
        }
        let hit = sentences.iter().find(|s| {
            analysis::terms(s).iter().any(|t| t == keyword)
        });
        if let Some(sentence) = hit {
            push_unique(&mut points, analysis::truncate_chars(sentence.trim(), 160));
        }
    }
    points
}

pub struct TextStrategy;

impl ProcessingStrategy for TextStrategy {
    fn name(&self) -> &str {
        "text"
    }

    fn content_type(&self) -> ContentType {
        ContentType::Text
    }

    fn priority(&self) -> u32 {
        10
    }

    fn process(&self, content: &str, _ctx: &ProcessingContext, _: &ChunkProcessor) -> Result<StrategyOutput> {
        let words = analysis::terms(content);
        if words.is_empty() {
            return Err(PipelineError::invalid("no words to analyze"));
        }

        let sentences = analysis::split_sentences(content);
        let sentence_count = sentences.len().max(1);
        let keywords = analysis::extract_keywords(content, 8);
        let topics: Vec<String> = keywords.iter().take(5).cloned().collect();
        let score = sentiment(&words);
        let label = if score > 0.2 {
            "positive"
        } else if score < -0.2 {
            "negative"
        } else {
            "neutral"
        };

        let entities = extract_entities(content);
        let key_points = key_sentences(&sentences, &keywords, 3);
        let richness =
            ((entities.len() + topics.len() + key_points.len()) as f64 / 15.0).min(1.0);

        Ok(StrategyOutput {
            analysis: Analysis::Text(TextAnalysis {
                sentence_count,
                word_count: words.len(),
                avg_sentence_length: words.len() as f64 / sentence_count as f64,
                readability: readability(&words, sentence_count),
                sentiment: score,
                sentiment_label: label.to_string(),
                topics,
                questions: content.matches('?').count(),
            }),
            summary: analysis::summarize(content, &keywords, 2),
            entities,
            key_points,
            richness,
            next_actions: Vec::new(),
        })
    }
}

// ============================================================================
// Code
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub language: String,
    pub functions: Vec<String>,
    pub types: Vec<String>,
    pub imports: Vec<String>,
    pub code_lines: usize,
    pub comment_lines: usize,
    pub nesting_depth: usize,
    /// 1 + branch points
    pub cyclomatic: usize,
}

/// Best guess at the language from syntax markers
pub fn guess_language(code: &str) -> &'static str {
    let has = |s: &str| code.contains(s);
    if has("fn ") && (has("let ") || has("impl ") || has("pub ") || has("->")) {
        "rust"
    } else if has("#include") {
        "c++"
    } else if has("package ") && has("func ") {
        "go"
    } else if has("def ") && has(":") {
        "python"
    } else if has("public class") || has("System.out") {
        "java"
    } else if has("function") || has("=>") || has("const ") {
        "javascript"
    } else if has("SELECT ") || (has("select ") && has(" from ")) {
        "sql"
    } else {
        "unknown"
    }
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    (t.starts_with('#') && !t.starts_with("#include"))
        || t.starts_with("//")
        || t.starts_with("/*")
        || t.starts_with('*')
        || t.starts_with("--")
}

fn cyclomatic(code: &str) -> usize {
    static BRANCH: OnceLock<Option<Regex>> = OnceLock::new();
    let keywords = cached_regex(
        &BRANCH,
        r"\b(?:if|elif|for|while|match|case|catch|except)\b|&&|\|\|",
    )
    .map_or(0, |re| re.find_iter(code).count());
    1 + keywords
}

pub struct CodeStrategy;

impl ProcessingStrategy for CodeStrategy {
    fn name(&self) -> &str {
        "code"
    }

    fn content_type(&self) -> ContentType {
        ContentType::Code
    }

    fn priority(&self) -> u32 {
        10
    }

    fn process(&self, content: &str, _ctx: &ProcessingContext, _: &ChunkProcessor) -> Result<StrategyOutput> {
        static FUNCTION: OnceLock<Option<Regex>> = OnceLock::new();
        static TYPE: OnceLock<Option<Regex>> = OnceLock::new();

        let code: String = content
            .lines()
            .filter(|l| !l.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n");
        if code.trim().is_empty() {
            return Err(PipelineError::invalid("empty code block"));
        }

        let mut functions = Vec::new();
        if let Some(re) = cached_regex(
            &FUNCTION,
            r"\b(?:fn|def|func|function)\s+([A-Za-z_][A-Za-z0-9_]*)",
        ) {
            for cap in re.captures_iter(&code) {
                push_unique(&mut functions, cap[1].to_string());
            }
        }

        let mut types = Vec::new();
        if let Some(re) = cached_regex(
            &TYPE,
            r"\b(?:struct|class|enum|trait|interface|type)\s+([A-Z][A-Za-z0-9_]*)",
        ) {
            for cap in re.captures_iter(&code) {
                push_unique(&mut types, cap[1].to_string());
            }
        }

        let mut imports = Vec::new();
        let mut comment_lines = 0;
        let mut code_lines = 0;
        for line in code.lines().filter(|l| !l.trim().is_empty()) {
            let t = line.trim();
            if t.starts_with("use ")
                || t.starts_with("import ")
                || t.starts_with("from ")
                || t.starts_with("#include")
                || t.contains("require(")
            {
                push_unique(&mut imports, t.trim_end_matches(';').to_string());
            }
            if is_comment(line) {
                comment_lines += 1;
            } else {
                code_lines += 1;
            }
        }

        let language = guess_language(&code).to_string();
        let nesting_depth = analysis::max_nesting_depth(&code);
        let cyclomatic = cyclomatic(&code);

        let mut next_actions = Vec::new();
        if cyclomatic > 10 || nesting_depth > 4 {
            next_actions.push(NextAction::ReviewCode);
        }

        let mut key_points = Vec::new();
        if !functions.is_empty() {
            key_points.push(format!("Functions: {}", functions.join(", ")));
        }
        if !types.is_empty() {
            key_points.push(format!("Types: {}", types.join(", ")));
        }
        if !imports.is_empty() {
            key_points.push(format!("{} imports", imports.len()));
        }
        key_points.push(format!(
            "Cyclomatic estimate {}, nesting depth {}",
            cyclomatic, nesting_depth
        ));

        let summary = format!(
            "{} code: {} lines, {} functions, {} types",
            language,
            code_lines,
            functions.len(),
            types.len()
        );
        let mut entities = functions.clone();
        entities.extend(types.iter().cloned());
        let richness = ((functions.len() + types.len() + imports.len()) as f64 / 10.0).min(1.0);

        Ok(StrategyOutput {
            analysis: Analysis::Code(CodeAnalysis {
                language,
                functions,
                types,
                imports,
                code_lines,
                comment_lines,
                nesting_depth,
                cyclomatic,
            }),
            entities,
            summary,
            key_points,
            richness,
            next_actions,
        })
    }
}

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Json,
    Csv,
    Table,
    KeyValue,
    Numeric,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl NumericStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            count,
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            mean,
            std_dev: variance.sqrt(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAnalysis {
    pub format: DataFormat,
    pub records: usize,
    pub fields: Vec<String>,
    pub numeric: Option<NumericStats>,
    pub anomalies: Vec<String>,
}

fn json_numbers(value: &serde_json::Value, out: &mut Vec<f64>) {
    match value {
        serde_json::Value::Number(n) => out.extend(n.as_f64()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| json_numbers(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| json_numbers(v, out)),
        _ => {}
    }
}

fn text_numbers(text: &str) -> Vec<f64> {
    static NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&NUMBER, r"-?\d+(?:\.\d+)?")
        .map(|re| {
            re.find_iter(text)
                .filter_map(|m| m.as_str().parse::<f64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn delimiter_of(lines: &[&str]) -> Option<char> {
    [',', ';', '\t'].into_iter().find(|d| {
        let first = lines[0].matches(*d).count();
        first > 0 && lines.iter().filter(|l| l.matches(*d).count() == first).count() * 2 > lines.len()
    })
}

fn analyze_json(value: &serde_json::Value) -> DataAnalysis {
    let (records, fields) = match value {
        serde_json::Value::Array(items) => {
            let keys: BTreeSet<String> = items
                .iter()
                .filter_map(|i| i.as_object())
                .flat_map(|o| o.keys().cloned())
                .collect();
            (items.len(), keys.into_iter().collect())
        }
        serde_json::Value::Object(map) => (1, map.keys().cloned().collect()),
        _ => (1, Vec::new()),
    };
    let mut numbers = Vec::new();
    json_numbers(value, &mut numbers);
    DataAnalysis {
        format: DataFormat::Json,
        records,
        fields,
        numeric: NumericStats::from_values(&numbers),
        anomalies: Vec::new(),
    }
}

fn analyze_text_data(text: &str) -> DataAnalysis {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .collect();
    let mut anomalies = Vec::new();

    if lines.is_empty() {
        return DataAnalysis {
            format: DataFormat::Unknown,
            records: 0,
            fields: Vec::new(),
            numeric: None,
            anomalies,
        };
    }

    let split_row = |line: &str, delim: char| -> Vec<String> {
        line.trim_matches('|')
            .split(delim)
            .map(|c| c.trim().to_string())
            .collect()
    };

    let (format, records, fields, body) = if lines.iter().filter(|l| l.starts_with('|')).count() >= 2 {
        let header = split_row(lines[0], '|');
        let body: Vec<&str> = lines
            .iter()
            .skip(1)
            .filter(|l| !l.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ')))
            .copied()
            .collect();
        (DataFormat::Table, body.len(), header, body)
    } else if let Some(delim) = (lines.len() >= 2).then(|| delimiter_of(&lines)).flatten() {
        let header = split_row(lines[0], delim);
        let has_header = header.iter().any(|h| h.parse::<f64>().is_err());
        let expected = header.len();
        for (i, line) in lines.iter().enumerate() {
            let cells = split_row(*line, delim);
            if cells.len() != expected {
                anomalies.push(format!(
                    "line {} has {} fields, expected {}",
                    i + 1,
                    cells.len(),
                    expected
                ));
            } else if cells.iter().any(String::is_empty) {
                anomalies.push(format!("line {} has empty fields", i + 1));
            }
        }
        let body: Vec<&str> = lines.iter().skip(usize::from(has_header)).copied().collect();
        let fields = if has_header { header } else { Vec::new() };
        (DataFormat::Csv, body.len(), fields, body)
    } else {
        let kv: Vec<(&str, &str)> = lines
            .iter()
            .filter_map(|l| l.split_once(':').or_else(|| l.split_once('=')))
            .filter(|(k, v)| !k.trim().is_empty() && !k.contains(' ') && !v.trim().is_empty())
            .collect();
        if kv.len() * 2 > lines.len() {
            let fields = kv.iter().map(|(k, _)| k.trim().to_string()).collect();
            (DataFormat::KeyValue, kv.len(), fields, lines.clone())
        } else if !text_numbers(text).is_empty() {
            (DataFormat::Numeric, lines.len(), Vec::new(), lines.clone())
        } else {
            (DataFormat::Unknown, lines.len(), Vec::new(), lines.clone())
        }
    };

    let numbers = text_numbers(&body.join("\n"));
    let numeric = NumericStats::from_values(&numbers);
    if let Some(stats) = &numeric {
        if stats.count >= 5 && stats.std_dev > 0.0 {
            for v in &numbers {
                if ((v - stats.mean) / stats.std_dev).abs() > 2.5 {
                    anomalies.push(format!("outlier value {}", v));
                }
            }
        }
    }

    DataAnalysis {
        format,
        records,
        fields,
        numeric,
        anomalies,
    }
}

pub struct DataStrategy;

impl ProcessingStrategy for DataStrategy {
    fn name(&self) -> &str {
        "data"
    }

    fn content_type(&self) -> ContentType {
        ContentType::Data
    }

    fn priority(&self) -> u32 {
        10
    }

    fn process(&self, content: &str, _ctx: &ProcessingContext, _: &ChunkProcessor) -> Result<StrategyOutput> {
        let trimmed = content.trim();
        let data = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) if trimmed.starts_with('{') || trimmed.starts_with('[') => analyze_json(&value),
            _ => analyze_text_data(content),
        };

        if data.format == DataFormat::Unknown && data.numeric.is_none() {
            return Err(PipelineError::invalid("unrecognized data layout"));
        }

        let mut key_points = vec![format!(
            "{} records across {} fields",
            data.records,
            data.fields.len()
        )];
        if let Some(stats) = &data.numeric {
            key_points.push(format!(
                "{} numeric values, range {} to {}, mean {:.2}",
                stats.count, stats.min, stats.max, stats.mean
            ));
        }
        key_points.extend(data.anomalies.iter().take(3).cloned());

        let mut next_actions = Vec::new();
        if !data.anomalies.is_empty() {
            next_actions.push(NextAction::ValidateData);
        }

        let summary = format!(
            "{:?} data with {} records and {} fields",
            data.format,
            data.records,
            data.fields.len()
        );
        let richness = ((data.fields.len() + usize::from(data.numeric.is_some()) * 3) as f64 / 10.0)
            .min(1.0);

        Ok(StrategyOutput {
            entities: data.fields.clone(),
            analysis: Analysis::Data(data),
            summary,
            key_points,
            richness,
            next_actions,
        })
    }
}

// ============================================================================
// Mixed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartSummary {
    pub index: usize,
    pub content_type: ContentType,
    pub words: usize,
    pub success: bool,
    pub summary: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedAnalysis {
    pub parts: Vec<PartSummary>,
    /// Sub-part analyses in part order (failed parts omitted)
    pub analyses: Vec<Analysis>,
    pub relationships: Vec<String>,
    pub patterns: Vec<String>,
}

pub struct MixedStrategy;

impl ProcessingStrategy for MixedStrategy {
    fn name(&self) -> &str {
        "mixed"
    }

    fn content_type(&self) -> ContentType {
        ContentType::Mixed
    }

    fn priority(&self) -> u32 {
        10
    }

    fn process(
        &self,
        content: &str,
        ctx: &ProcessingContext,
        processor: &ChunkProcessor,
    ) -> Result<StrategyOutput> {
        let split = analysis::split_homogeneous(content);
        if split.is_empty() {
            return Err(PipelineError::invalid("nothing to split"));
        }

        let mut parts = Vec::new();
        let mut analyses = Vec::new();
        let mut entities = Vec::new();
        let mut summaries = Vec::new();
        let mut richness_total = 0.0;
        let mut next_actions = BTreeSet::new();
        let mut part_terms: Vec<Vec<String>> = Vec::new();

        for (index, (content_type, text)) in split.iter().enumerate() {
            let content_type = match content_type {
                ContentType::Mixed => ContentType::Text,
                other => *other,
            };
            part_terms.push(analysis::extract_keywords(text, 10));

            match processor.process_part(content_type, text, ctx) {
                Ok(output) => {
                    richness_total += output.richness;
                    for e in output.entities {
                        push_unique(&mut entities, e);
                    }
                    next_actions.extend(output.next_actions);
                    summaries.push(output.summary.clone());
                    analyses.push(output.analysis);
                    parts.push(PartSummary {
                        index,
                        content_type,
                        words: analysis::word_count(text),
                        success: true,
                        summary: output.summary,
                        error: None,
                    });
                }
                Err(e) => parts.push(PartSummary {
                    index,
                    content_type,
                    words: analysis::word_count(text),
                    success: false,
                    summary: String::new(),
                    error: Some(e.to_string()),
                }),
            }
        }

        if parts.iter().all(|p| !p.success) {
            return Err(PipelineError::invalid("every part of the mixed chunk failed"));
        }

        let relationships = relationships(&parts, &part_terms);
        let patterns = patterns(&parts);
        let succeeded = parts.iter().filter(|p| p.success).count();

        let mut key_points: Vec<String> = patterns.iter().take(2).cloned().collect();
        key_points.extend(relationships.iter().take(3).cloned());

        Ok(StrategyOutput {
            analysis: Analysis::Mixed(MixedAnalysis {
                parts,
                analyses,
                relationships,
                patterns,
            }),
            entities,
            summary: analysis::truncate_chars(&summaries.join(" "), 280),
            key_points,
            richness: richness_total / succeeded.max(1) as f64,
            next_actions: next_actions.into_iter().collect(),
        })
    }
}

fn relationships(parts: &[PartSummary], terms: &[Vec<String>]) -> Vec<String> {
    let mut out = Vec::new();
    for i in 1..parts.len() {
        let (a, b) = (&parts[i - 1], &parts[i]);
        if a.content_type == ContentType::Text && b.content_type != ContentType::Text {
            out.push(format!(
                "text part {} introduces {} part {}",
                a.index, b.content_type, b.index
            ));
        }
        let shared: Vec<&String> = terms[i - 1].iter().filter(|t| terms[i].contains(t)).collect();
        if !shared.is_empty() && a.content_type != b.content_type {
            out.push(format!(
                "{} part {} and {} part {} share terms: {}",
                a.content_type,
                a.index,
                b.content_type,
                b.index,
                shared.iter().take(5).map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
    }
    out
}

fn patterns(parts: &[PartSummary]) -> Vec<String> {
    let mut out = Vec::new();
    let total_words: usize = parts.iter().map(|p| p.words).sum();
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    for part in parts {
        *by_type.entry(part.content_type.to_string()).or_insert(0) += part.words;
    }
    if let Some((kind, words)) = by_type.iter().max_by_key(|(_, w)| **w) {
        out.push(format!(
            "dominant content: {} ({:.0}% of words)",
            kind,
            100.0 * *words as f64 / total_words.max(1) as f64
        ));
    }
    let alternating = parts.len() >= 3
        && parts.windows(2).all(|w| w[0].content_type != w[1].content_type);
    if alternating {
        out.push(format!("{} alternating sections", parts.len()));
    }
    let code_blocks = parts.iter().filter(|p| p.content_type == ContentType::Code).count();
    if code_blocks > 1 {
        out.push(format!("{} separate code blocks", code_blocks));
    }
    out
}
