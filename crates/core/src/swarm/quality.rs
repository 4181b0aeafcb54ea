//! # Quality Gate
//!
//! Scores a validator's report: weighted aggregate of per-dimension scores on
//! a 0-10 scale, checked against a threshold and the critical-finding budget.

use serde::{Deserialize, Serialize};

use crate::error::{BatonError, Result};

/// Gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    PassWithWarnings,
    NeedsFix,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::PassWithWarnings => "PASS_WITH_WARNINGS",
            Self::NeedsFix => "NEEDS_FIX",
            Self::Fail => "FAIL",
        }
    }

    /// Whether the gate sends the work back for remediation
    pub fn needs_remediation(&self) -> bool {
        matches!(self, Self::NeedsFix | Self::Fail)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    /// Minimum aggregate for a passing verdict
    pub threshold: f64,
    /// Aggregate below which the verdict is FAIL
    pub fail_below: f64,
    /// Critical findings tolerated before NEEDS_FIX
    pub max_critical: u32,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            threshold: 8.0,
            fail_below: 5.0,
            max_critical: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
}

/// One scored dimension (correctness, coverage, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub score: f64,
    pub weight: f64,
}

/// What a validating worker attaches to its `task_complete` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl QualityReport {
    /// Report with equally weighted, anonymous dimensions
    pub fn from_scores(scores: &[f64]) -> Self {
        let weight = if scores.is_empty() {
            0.0
        } else {
            1.0 / scores.len() as f64
        };
        Self {
            dimensions: scores
                .iter()
                .enumerate()
                .map(|(i, score)| Dimension {
                    name: format!("d{}", i + 1),
                    score: *score,
                    weight,
                })
                .collect(),
            findings: Vec::new(),
        }
    }

    pub fn with_finding(mut self, severity: Severity, description: impl Into<String>) -> Self {
        self.findings.push(Finding {
            severity,
            description: description.into(),
        });
        self
    }

    fn count(&self, severity: Severity) -> u32 {
        self.findings.iter().filter(|f| f.severity == severity).count() as u32
    }

    /// Weighted aggregate, normalised by the total weight
    pub fn aggregate(&self) -> Result<f64> {
        if self.dimensions.is_empty() {
            return Err(BatonError::validation("quality report has no dimensions"));
        }
        let mut total_weight = 0.0;
        let mut sum = 0.0;
        for d in &self.dimensions {
            if !(0.0..=10.0).contains(&d.score) {
                return Err(BatonError::validation(format!(
                    "dimension '{}' score {} is outside 0-10",
                    d.name, d.score
                )));
            }
            if d.weight < 0.0 || !d.weight.is_finite() {
                return Err(BatonError::validation(format!(
                    "dimension '{}' has invalid weight {}",
                    d.name, d.weight
                )));
            }
            total_weight += d.weight;
            sum += d.score * d.weight;
        }
        if total_weight <= 0.0 {
            return Err(BatonError::validation("quality report weights sum to zero"));
        }
        Ok(sum / total_weight)
    }
}

/// Result of a gate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub verdict: Verdict,
    pub score: f64,
    pub critical: u32,
    pub warnings: u32,
}

/// Evaluate a report against the configured thresholds
pub fn evaluate(report: &QualityReport, config: &QualityGateConfig) -> Result<GateOutcome> {
    let score = report.aggregate()?;
    let critical = report.count(Severity::Critical);
    let warnings = report.count(Severity::Warning);

    let verdict = if score < config.fail_below {
        Verdict::Fail
    } else if critical > config.max_critical || score < config.threshold {
        Verdict::NeedsFix
    } else if warnings > 0 || critical > 0 {
        Verdict::PassWithWarnings
    } else {
        Verdict::Pass
    };

    Ok(GateOutcome {
        verdict,
        score,
        critical,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_needs_fix() {
        let report = QualityReport {
            dimensions: [9.0, 7.0, 8.0, 6.0]
                .iter()
                .enumerate()
                .map(|(i, s)| Dimension {
                    name: format!("dim{i}"),
                    score: *s,
                    weight: 0.25,
                })
                .collect(),
            findings: Vec::new(),
        };
        let outcome = evaluate(&report, &QualityGateConfig::default()).unwrap();
        assert!((outcome.score - 7.5).abs() < f64::EPSILON);
        assert_eq!(outcome.verdict, Verdict::NeedsFix);
    }

    #[test]
    fn test_verdict_ladder() {
        let config = QualityGateConfig::default();
        let verdict = |r: QualityReport| evaluate(&r, &config).unwrap().verdict;

        assert_eq!(verdict(QualityReport::from_scores(&[9.0, 9.0])), Verdict::Pass);
        assert_eq!(
            verdict(QualityReport::from_scores(&[9.0]).with_finding(Severity::Warning, "naming")),
            Verdict::PassWithWarnings
        );
        assert_eq!(
            verdict(QualityReport::from_scores(&[9.5]).with_finding(Severity::Critical, "sqli")),
            Verdict::NeedsFix
        );
        assert_eq!(verdict(QualityReport::from_scores(&[3.0, 4.0])), Verdict::Fail);
    }

    #[test]
    fn test_weights_are_normalised() {
        let report = QualityReport {
            dimensions: vec![
                Dimension {
                    name: "a".into(),
                    score: 10.0,
                    weight: 3.0,
                },
                Dimension {
                    name: "b".into(),
                    score: 6.0,
                    weight: 1.0,
                },
            ],
            findings: Vec::new(),
        };
        assert!((report.aggregate().unwrap() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_reports_rejected() {
        assert!(QualityReport::default().aggregate().is_err());
        assert!(QualityReport::from_scores(&[11.0]).aggregate().is_err());
    }

    #[test]
    fn test_verdict_wire_format() {
        assert_eq!(
            serde_json::to_string(&Verdict::PassWithWarnings).unwrap(),
            "\"PASS_WITH_WARNINGS\""
        );
    }
}
