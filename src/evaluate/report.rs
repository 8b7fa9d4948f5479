//! Final result assembly
//!
//! Folds aggregated validations, aggregated evaluations, synthesized info
//! and the collected chunk results into one document-level `FinalResult`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AggregatedEvaluation, AggregatedValidation};
use crate::processor::{NextAction, ProcessingResult};

const MAX_KEY_FINDINGS: usize = 10;

/// Information synthesized from the deduplicated results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesizedInfo {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub themes: Vec<String>,
    /// Results that fed the synthesis
    pub sources: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    /// Validator, evaluator or processor that raised it
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub overall_score: f64,
    pub confidence: f64,
    pub validation_passed: bool,
    pub key_findings: Vec<String>,
    pub text: String,
}

/// Document-level aggregate handed to delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub id: String,
    pub content_id: String,
    pub created_at: DateTime<Utc>,
    pub summary: ResultSummary,
    pub validations: Vec<AggregatedValidation>,
    pub evaluations: Vec<AggregatedEvaluation>,
    pub synthesized: SynthesizedInfo,
    pub results: Vec<ProcessingResult>,
    /// Sorted High, Medium, Low; order within a priority is stable
    pub recommendations: Vec<Recommendation>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn push_recommendation(out: &mut Vec<Recommendation>, rec: Recommendation) {
    if !out.iter().any(|r| r.text == rec.text) {
        out.push(rec);
    }
}

pub fn create_final_result(
    content_id: &str,
    validations: Vec<AggregatedValidation>,
    evaluations: Vec<AggregatedEvaluation>,
    synthesized: SynthesizedInfo,
    collected: Vec<ProcessingResult>,
) -> FinalResult {
    let eval_score = mean(evaluations.iter().map(|e| e.overall));
    let validation_score = mean(validations.iter().map(|v| v.score));
    let overall_score = match (eval_score, validation_score) {
        (Some(e), Some(v)) => 0.6 * e + 0.4 * v,
        (Some(e), None) => e,
        (None, Some(v)) => v,
        (None, None) => 0.0,
    };
    let confidence = mean(collected.iter().filter(|r| r.success).map(|r| r.confidence)).unwrap_or(0.0);
    let validation_passed = validations.iter().all(|v| v.passed);

    let mut key_findings: Vec<String> = Vec::new();
    let mut ranked: Vec<&ProcessingResult> = collected.iter().filter(|r| r.success).collect();
    ranked.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let candidates = synthesized
        .key_findings
        .iter()
        .chain(ranked.iter().flat_map(|r| r.key_points.iter()));
    for finding in candidates {
        if key_findings.len() >= MAX_KEY_FINDINGS {
            break;
        }
        if !finding.is_empty() && !key_findings.contains(finding) {
            key_findings.push(finding.clone());
        }
    }

    let mut recommendations = Vec::new();
    for validation in validations.iter().filter(|v| !v.passed) {
        let texts = if validation.recommendations.is_empty() {
            &validation.issues
        } else {
            &validation.recommendations
        };
        for text in texts {
            push_recommendation(
                &mut recommendations,
                Recommendation {
                    priority: Priority::High,
                    source: validation.validator.to_string(),
                    text: text.clone(),
                },
            );
        }
    }
    for evaluation in &evaluations {
        for weakness in &evaluation.weaknesses {
            push_recommendation(
                &mut recommendations,
                Recommendation {
                    priority: Priority::Medium,
                    source: evaluation.evaluator.to_string(),
                    text: format!("Improve {}: {}", evaluation.evaluator, weakness.to_lowercase()),
                },
            );
        }
    }
    let mut actions: BTreeMap<NextAction, usize> = BTreeMap::new();
    for action in collected.iter().flat_map(|r| r.next_actions.iter()) {
        *actions.entry(*action).or_insert(0) += 1;
    }
    for (action, count) in actions {
        push_recommendation(
            &mut recommendations,
            Recommendation {
                priority: Priority::Low,
                source: "processor".to_string(),
                text: format!(
                    "Follow up with {} on {} chunk{}",
                    action.as_str().replace('_', " "),
                    count,
                    if count == 1 { "" } else { "s" }
                ),
            },
        );
    }
    recommendations.sort_by_key(|r| r.priority);

    let failed = collected.iter().filter(|r| !r.success).count();
    let text = format!(
        "{} chunk results ({} failed); overall score {:.0}%, confidence {:.0}%, validation {}",
        collected.len(),
        failed,
        overall_score * 100.0,
        confidence * 100.0,
        if validation_passed { "passed" } else { "failed" }
    );

    FinalResult {
        id: Uuid::new_v4().to_string(),
        content_id: content_id.to_string(),
        created_at: Utc::now(),
        summary: ResultSummary {
            overall_score,
            confidence,
            validation_passed,
            key_findings,
            text,
        },
        validations,
        evaluations,
        synthesized,
        results: collected,
        recommendations,
    }
}

impl FinalResult {
    /// Merge a batch into one synthetic result: scores averaged, findings
    /// and recommendations concatenated without repeats.
    pub fn combine(content_id: &str, batch: &[FinalResult]) -> Option<FinalResult> {
        if batch.is_empty() {
            return None;
        }

        let n = batch.len() as f64;
        let overall_score = batch.iter().map(|r| r.summary.overall_score).sum::<f64>() / n;
        let confidence = batch.iter().map(|r| r.summary.confidence).sum::<f64>() / n;
        let validation_passed = batch.iter().all(|r| r.summary.validation_passed);

        let mut key_findings: Vec<String> = Vec::new();
        let mut recommendations = Vec::new();
        let mut synthesized = SynthesizedInfo::default();
        for result in batch {
            for finding in &result.summary.key_findings {
                if !key_findings.contains(finding) {
                    key_findings.push(finding.clone());
                }
            }
            for rec in &result.recommendations {
                push_recommendation(&mut recommendations, rec.clone());
            }
            for theme in &result.synthesized.themes {
                if !synthesized.themes.contains(theme) {
                    synthesized.themes.push(theme.clone());
                }
            }
            synthesized.sources += result.synthesized.sources;
        }
        recommendations.sort_by_key(|r| r.priority);
        synthesized.key_findings = key_findings.clone();
        synthesized.summary = batch
            .iter()
            .map(|r| r.synthesized.summary.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Some(FinalResult {
            id: Uuid::new_v4().to_string(),
            content_id: content_id.to_string(),
            created_at: Utc::now(),
            summary: ResultSummary {
                overall_score,
                confidence,
                validation_passed,
                key_findings,
                text: format!(
                    "Batch of {} results; mean score {:.0}%, mean confidence {:.0}%",
                    batch.len(),
                    overall_score * 100.0,
                    confidence * 100.0
                ),
            },
            validations: batch.iter().flat_map(|r| r.validations.clone()).collect(),
            evaluations: batch.iter().flat_map(|r| r.evaluations.clone()).collect(),
            synthesized,
            results: batch.iter().flat_map(|r| r.results.clone()).collect(),
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{MetricKind, ValidatorKind};
    use crate::swarm::ContentType;

    fn validation(kind: ValidatorKind, passed: bool, score: f64) -> AggregatedValidation {
        AggregatedValidation {
            validator: kind,
            passed,
            score,
            threshold: 0.8,
            chunks: 1,
            issues: vec![format!("{} issue", kind)],
            recommendations: if passed { vec![] } else { vec![format!("Fix {}", kind)] },
        }
    }

    fn evaluation(kind: MetricKind, overall: f64, weaknesses: Vec<String>) -> AggregatedEvaluation {
        AggregatedEvaluation {
            evaluator: kind,
            metrics: BTreeMap::new(),
            overall,
            strengths: vec![],
            weaknesses,
            chunks: 1,
            rank: 1,
        }
    }

    fn result(id: &str, success: bool, confidence: f64, points: &[&str]) -> ProcessingResult {
        ProcessingResult {
            chunk_id: id.into(),
            strategy: "text".into(),
            content_type: ContentType::Text,
            success,
            analysis: None,
            confidence,
            entities: vec![],
            summary: String::new(),
            key_points: points.iter().map(|p| p.to_string()).collect(),
            next_actions: if success {
                vec![NextAction::DeepAnalysis]
            } else {
                vec![NextAction::Retry, NextAction::Escalate]
            },
            error: None,
            worker_id: "w".into(),
            processing_ms: 1,
            quality_score: confidence,
        }
    }

    #[test]
    fn test_scores_and_findings() {
        let final_result = create_final_result(
            "doc",
            vec![validation(ValidatorKind::Accuracy, true, 1.0)],
            vec![evaluation(MetricKind::Quality, 0.5, vec![])],
            SynthesizedInfo {
                key_findings: vec!["Synthesized".into()],
                ..Default::default()
            },
            vec![
                result("a", true, 0.6, &["Low point"]),
                result("b", true, 0.9, &["High point"]),
                result("c", false, 0.0, &[]),
            ],
        );
        assert!((final_result.summary.overall_score - (0.6 * 0.5 + 0.4 * 1.0)).abs() < 1e-9);
        assert!((final_result.summary.confidence - 0.75).abs() < 1e-9);
        assert!(final_result.summary.validation_passed);
        assert_eq!(
            final_result.summary.key_findings,
            vec!["Synthesized", "High point", "Low point"]
        );
        assert!(final_result.summary.text.contains("(1 failed)"));
    }

    #[test]
    fn test_recommendations_ranked_by_priority() {
        let final_result = create_final_result(
            "doc",
            vec![
                validation(ValidatorKind::Accuracy, true, 0.9),
                validation(ValidatorKind::Completeness, false, 0.5),
            ],
            vec![evaluation(MetricKind::Impact, 0.2, vec!["Weak significance".into()])],
            SynthesizedInfo::default(),
            vec![result("a", true, 0.5, &[]), result("b", true, 0.5, &[])],
        );
        let recs: Vec<(Priority, &str)> = final_result
            .recommendations
            .iter()
            .map(|r| (r.priority, r.text.as_str()))
            .collect();
        assert_eq!(
            recs,
            vec![
                (Priority::High, "Fix completeness"),
                (Priority::Medium, "Improve impact: weak significance"),
                (Priority::Low, "Follow up with deep analysis on 2 chunks"),
            ]
        );
        assert!(!final_result.summary.validation_passed);
    }

    #[test]
    fn test_combine_averages_and_concatenates() {
        let a = create_final_result(
            "a",
            vec![],
            vec![evaluation(MetricKind::Quality, 0.4, vec![])],
            SynthesizedInfo::default(),
            vec![result("a:0", true, 0.4, &["first"])],
        );
        let b = create_final_result(
            "b",
            vec![],
            vec![evaluation(MetricKind::Quality, 0.8, vec![])],
            SynthesizedInfo::default(),
            vec![result("b:0", true, 0.8, &["second", "first"])],
        );
        let combined = FinalResult::combine("batch", &[a, b]).unwrap();
        assert!((combined.summary.overall_score - 0.6).abs() < 1e-9);
        assert!((combined.summary.confidence - 0.6).abs() < 1e-9);
        assert_eq!(combined.summary.key_findings, vec!["first", "second"]);
        assert_eq!(combined.results.len(), 2);
        assert_eq!(combined.recommendations.len(), 1);
        assert!(FinalResult::combine("empty", &[]).is_none());
    }
}
