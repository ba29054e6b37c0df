use serde::{Deserialize, Serialize};

/// Half-up rounding to 2 decimals on the scaled value:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScores {
    pub written_work: Option<f64>,
    pub performance_task: Option<f64>,
    pub quarterly_assessment: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeWeights {
    pub written_work: f64,
    pub performance_task: f64,
    pub quarterly_assessment: f64,
}

impl Default for GradeWeights {
    fn default() -> Self {
        Self {
            written_work: 0.25,
            performance_task: 0.50,
            quarterly_assessment: 0.25,
        }
    }
}

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

impl GradeWeights {
    /// Checked at the settings boundary only. The calculator itself trusts
    /// whatever weights it is handed.
    pub fn validate(&self) -> Result<(), CalcError> {
        for (key, w) in [
            ("writtenWork", self.written_work),
            ("performanceTask", self.performance_task),
            ("quarterlyAssessment", self.quarterly_assessment),
        ] {
            if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                return Err(CalcError::new(
                    "bad_params",
                    format!("{} weight must be between 0 and 1", key),
                ));
            }
        }
        let sum = self.written_work + self.performance_task + self.quarterly_assessment;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            let mut e = CalcError::new("bad_params", "grade weights must sum to 1.0");
            e.details = Some(serde_json::json!({ "sum": sum }));
            return Err(e);
        }
        Ok(())
    }
}

/// Weighted final grade. Absent components count as 0 and stay in the sum;
/// out-of-range inputs are not clamped.
pub fn compute_final_grade(scores: &ComponentScores, weights: &GradeWeights) -> f64 {
    let ww = scores.written_work.unwrap_or(0.0);
    let pt = scores.performance_task.unwrap_or(0.0);
    let qa = scores.quarterly_assessment.unwrap_or(0.0);
    let raw = ww * weights.written_work
        + pt * weights.performance_task
        + qa * weights.quarterly_assessment;
    round_off_2_decimals(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemarkBand {
    Outstanding,
    VerySatisfactory,
    Satisfactory,
    FairlySatisfactory,
    DidNotMeetExpectations,
}

impl RemarkBand {
    pub fn as_str(self) -> &'static str {
        match self {
            RemarkBand::Outstanding => "outstanding",
            RemarkBand::VerySatisfactory => "very_satisfactory",
            RemarkBand::Satisfactory => "satisfactory",
            RemarkBand::FairlySatisfactory => "fairly_satisfactory",
            RemarkBand::DidNotMeetExpectations => "did_not_meet_expectations",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RemarkBand::Outstanding => "Outstanding",
            RemarkBand::VerySatisfactory => "Very Satisfactory",
            RemarkBand::Satisfactory => "Satisfactory",
            RemarkBand::FairlySatisfactory => "Fairly Satisfactory",
            RemarkBand::DidNotMeetExpectations => "Did Not Meet Expectations",
        }
    }

    pub fn passed(self) -> bool {
        self != RemarkBand::DidNotMeetExpectations
    }
}

/// Lower bounds are inclusive.
pub fn remark_for(grade: f64) -> RemarkBand {
    if grade >= 90.0 {
        RemarkBand::Outstanding
    } else if grade >= 85.0 {
        RemarkBand::VerySatisfactory
    } else if grade >= 80.0 {
        RemarkBand::Satisfactory
    } else if grade >= 75.0 {
        RemarkBand::FairlySatisfactory
    } else {
        RemarkBand::DidNotMeetExpectations
    }
}

/// Subject final across quarters: mean of the quarters that have a grade.
pub fn quarter_average(quarters: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = quarters.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    Some(round_off_2_decimals(
        present.iter().sum::<f64>() / (present.len() as f64),
    ))
}

pub fn general_average(subject_finals: &[f64]) -> Option<f64> {
    if subject_finals.is_empty() {
        return None;
    }
    Some(round_off_2_decimals(
        subject_finals.iter().sum::<f64>() / (subject_finals.len() as f64),
    ))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemarkDistribution {
    pub outstanding: usize,
    pub very_satisfactory: usize,
    pub satisfactory: usize,
    pub fairly_satisfactory: usize,
    pub did_not_meet_expectations: usize,
}

impl RemarkDistribution {
    pub fn from_grades<I>(grades: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut out = Self::default();
        for g in grades {
            out.add(remark_for(g));
        }
        out
    }

    pub fn add(&mut self, band: RemarkBand) {
        match band {
            RemarkBand::Outstanding => self.outstanding += 1,
            RemarkBand::VerySatisfactory => self.very_satisfactory += 1,
            RemarkBand::Satisfactory => self.satisfactory += 1,
            RemarkBand::FairlySatisfactory => self.fairly_satisfactory += 1,
            RemarkBand::DidNotMeetExpectations => self.did_not_meet_expectations += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.outstanding
            + self.very_satisfactory
            + self.satisfactory
            + self.fairly_satisfactory
            + self.did_not_meet_expectations
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn parse_score_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<f64>, CalcError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(n) = v.as_f64() else {
                return Err(CalcError::new(
                    "bad_params",
                    format!("scores.{} must be a number or null", key),
                ));
            };
            if !(0.0..=100.0).contains(&n) {
                let mut e = CalcError::new(
                    "bad_params",
                    format!("scores.{} must be between 0 and 100", key),
                );
                e.details = Some(serde_json::json!({ "value": n }));
                return Err(e);
            }
            Ok(Some(n))
        }
    }
}

/// Request-side parsing. Range checks live here, not in `compute_final_grade`.
pub fn parse_component_scores(raw: Option<&serde_json::Value>) -> Result<ComponentScores, CalcError> {
    let Some(raw) = raw else {
        return Ok(ComponentScores::default());
    };
    let Some(obj) = raw.as_object() else {
        return Err(CalcError::new("bad_params", "scores must be an object"));
    };
    Ok(ComponentScores {
        written_work: parse_score_field(obj, "writtenWork")?,
        performance_task: parse_score_field(obj, "performanceTask")?,
        quarterly_assessment: parse_score_field(obj, "quarterlyAssessment")?,
    })
}

pub fn parse_grade_weights(raw: &serde_json::Value) -> Result<GradeWeights, CalcError> {
    let weights: GradeWeights = serde_json::from_value(raw.clone()).map_err(|e| {
        CalcError::new("bad_params", format!("weights must be an object of numbers: {}", e))
    })?;
    weights.validate()?;
    Ok(weights)
}
