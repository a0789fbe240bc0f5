use chrono::{DateTime, Utc};

/// One page-view row from the Canvas request log.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: i64,
    pub remote_ip: Option<String>,
    pub http_method: Option<String>,
    pub http_status: Option<i32>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
    pub context_type: Option<String>,
    pub context_id: Option<i64>,
    pub assignment_id: Option<i64>,
    pub participated: bool,
}

/// One submitted or graded assignment attempt.
///
/// `submitted_at` is nullable in the Canvas schema; a row without it cannot be
/// placed in a matching window and degrades to a no-match result.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub user_id: i64,
    pub assignment_id: i64,
    pub assignment_name: String,
    pub course_name: String,
    pub attempt: Option<i64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub workflow_state: String,
    pub submission_type: Option<String>,
    pub score: Option<f64>,
    pub graded_at: Option<DateTime<Utc>>,
}

/// Confidence ranking for a matched activity record. Lower rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    /// A confirmed submit-style request against the same assignment.
    ConfirmedSubmit,
    /// A participation-flagged request against the same assignment.
    Participation,
    /// Anything else inside the time window.
    Proximity,
}

impl MatchTier {
    pub fn rank(self) -> u8 {
        match self {
            MatchTier::ConfirmedSubmit => 1,
            MatchTier::Participation => 2,
            MatchTier::Proximity => 3,
        }
    }
}

/// The single best activity match for one submission, or none.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub user_id: i64,
    pub assignment_id: i64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub matched_activity: Option<ActivityRecord>,
    pub tier: Option<MatchTier>,
}

/// Which provider produced a geolocation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Primary,
    Fallback,
    None,
}

impl std::fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedBy::Primary => write!(f, "primary"),
            ResolvedBy::Fallback => write!(f, "fallback"),
            ResolvedBy::None => write!(f, "none"),
        }
    }
}

/// Geolocation fields for one IP, keyed by the exact IP string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoResult {
    pub ip: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub organization: String,
    pub resolved_by: ResolvedBy,
}

impl GeoResult {
    /// All-empty result for IPs that could not (or should not) be resolved.
    pub fn unresolved(ip: &str) -> Self {
        GeoResult {
            ip: ip.to_string(),
            country: String::new(),
            region: String::new(),
            city: String::new(),
            organization: String::new(),
            resolved_by: ResolvedBy::None,
        }
    }
}
