use chrono::Duration;

use crate::models::{ActivityRecord, MatchResult, MatchTier, SubmissionRecord};

const SUBMIT_CONTROLLERS: [&str; 3] = ["submissions", "assignment_submissions", "quiz_submissions"];
const SUBMIT_ACTIONS: [&str; 5] = ["create", "update", "submit", "finish", "complete"];
const SUBMIT_METHODS: [&str; 2] = ["POST", "PUT"];

/// Match each submission to its most likely originating activity-log row.
///
/// Candidates are activity rows for the same user whose timestamp falls within
/// `submitted_at ± window` (both ends inclusive). The best candidate is the one
/// with the lowest tier, then the smallest distance from the submit time; ties
/// beyond that keep input order. Submissions without a usable `submitted_at`
/// yield a no-match result rather than failing the run.
pub fn correlate(
    submissions: &[SubmissionRecord],
    activity: &[ActivityRecord],
    window: Duration,
) -> Vec<MatchResult> {
    submissions
        .iter()
        .map(|submission| {
            let submitted_at = match submission.submitted_at {
                Some(ts) => ts,
                None => {
                    log::warn!(
                        "submission for assignment {} has no submitted_at; skipping match",
                        submission.assignment_id
                    );
                    return MatchResult {
                        user_id: submission.user_id,
                        assignment_id: submission.assignment_id,
                        submitted_at: None,
                        matched_activity: None,
                        tier: None,
                    };
                }
            };

            let mut candidates: Vec<(MatchTier, Duration, &ActivityRecord)> = activity
                .iter()
                .filter(|record| record.user_id == submission.user_id)
                .filter(|record| {
                    record.timestamp >= submitted_at - window
                        && record.timestamp <= submitted_at + window
                })
                .map(|record| {
                    let distance = (record.timestamp - submitted_at).abs();
                    (classify(record, submission), distance, record)
                })
                .collect();

            // Stable sort: fully tied candidates keep input order.
            candidates.sort_by_key(|(tier, distance, _)| (*tier, *distance));

            let best = candidates.first();
            MatchResult {
                user_id: submission.user_id,
                assignment_id: submission.assignment_id,
                submitted_at: Some(submitted_at),
                matched_activity: best.map(|(_, _, record)| (*record).clone()),
                tier: best.map(|(tier, _, _)| *tier),
            }
        })
        .collect()
}

/// Tier a candidate already known to be inside the time window.
fn classify(record: &ActivityRecord, submission: &SubmissionRecord) -> MatchTier {
    let references = references_assignment(record, submission.assignment_id);

    if references
        && matches_any(record.controller.as_deref(), &SUBMIT_CONTROLLERS)
        && matches_any(record.action.as_deref(), &SUBMIT_ACTIONS)
        && matches_any(record.http_method.as_deref(), &SUBMIT_METHODS)
    {
        return MatchTier::ConfirmedSubmit;
    }

    if record.participated && references {
        return MatchTier::Participation;
    }

    MatchTier::Proximity
}

fn matches_any(value: Option<&str>, allowed: &[&str]) -> bool {
    value.is_some_and(|v| allowed.iter().any(|a| v.eq_ignore_ascii_case(a)))
}

/// Whether an activity row points at the given assignment: a direct id, an
/// Assignment context, or an `assignments/<id>` path segment in the URL. A bare
/// numeric substring is not enough; it collides with course and quiz ids.
fn references_assignment(record: &ActivityRecord, assignment_id: i64) -> bool {
    if record.assignment_id == Some(assignment_id) {
        return true;
    }
    if record.context_type.as_deref() == Some("Assignment")
        && record.context_id == Some(assignment_id)
    {
        return true;
    }
    record
        .url
        .as_deref()
        .is_some_and(|url| url.contains(&format!("assignments/{assignment_id}")))
}
