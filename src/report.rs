use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::export::fmt_ts;
use crate::models::{GeoResult, MatchResult, SubmissionRecord};

/// Render the narrative summary: submissions grouped by course, each with its
/// submit time, originating IP and resolved location.
pub fn build_summary(
    username: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    submissions: &[SubmissionRecord],
    matches: &[MatchResult],
    geo: &BTreeMap<String, GeoResult>,
) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# {username} logs summary report");
    let _ = writeln!(
        output,
        "Window: {} to {} (UTC)",
        fmt_ts(Some(start)),
        fmt_ts(Some(end))
    );

    let mut by_course: BTreeMap<&str, Vec<(&SubmissionRecord, &MatchResult)>> = BTreeMap::new();
    for (submission, result) in submissions.iter().zip(matches.iter()) {
        by_course
            .entry(submission.course_name.as_str())
            .or_default()
            .push((submission, result));
    }

    if by_course.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No submissions found in this window.");
        return output;
    }

    for (course, entries) in by_course {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Course: {course}");
        let _ = writeln!(output, "Assignments submitted:");
        for (submission, result) in entries {
            let matched = result.matched_activity.as_ref();
            let ip = matched
                .and_then(|m| m.remote_ip.as_deref())
                .unwrap_or_default();
            let _ = writeln!(output, "- {}", submission.assignment_name);
            let _ = writeln!(output, "  - Submitted: {}", fmt_ts(submission.submitted_at));
            let _ = writeln!(output, "  - IP address: {ip}");
            let _ = writeln!(output, "  - IP address location: {}", location_line(geo, ip));
            if let Some(tier) = result.tier {
                let _ = writeln!(output, "  - Match confidence: tier {}", tier.rank());
            } else {
                let _ = writeln!(output, "  - Match confidence: no activity match");
            }
        }
    }

    output
}

fn location_line(geo: &BTreeMap<String, GeoResult>, ip: &str) -> String {
    let Some(result) = geo.get(ip) else {
        return String::new();
    };
    let parts: Vec<&str> = [
        result.city.as_str(),
        result.region.as_str(),
        result.country.as_str(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityRecord, MatchTier, ResolvedBy};

    fn submission(course: &str, assignment: &str) -> SubmissionRecord {
        SubmissionRecord {
            user_id: 42,
            assignment_id: 900,
            assignment_name: assignment.to_string(),
            course_name: course.to_string(),
            attempt: Some(1),
            submitted_at: Some("2025-09-01T14:00:00Z".parse().unwrap()),
            workflow_state: "submitted".to_string(),
            submission_type: None,
            score: None,
            graded_at: None,
        }
    }

    fn matched(ip: &str) -> MatchResult {
        MatchResult {
            user_id: 42,
            assignment_id: 900,
            submitted_at: Some("2025-09-01T14:00:00Z".parse().unwrap()),
            matched_activity: Some(ActivityRecord {
                timestamp: "2025-09-01T14:02:00Z".parse().unwrap(),
                user_id: 42,
                remote_ip: Some(ip.to_string()),
                http_method: Some("POST".to_string()),
                http_status: Some(200),
                url: None,
                user_agent: None,
                session_id: None,
                controller: Some("submissions".to_string()),
                action: Some("create".to_string()),
                context_type: None,
                context_id: None,
                assignment_id: Some(900),
                participated: true,
            }),
            tier: Some(MatchTier::ConfirmedSubmit),
        }
    }

    #[test]
    fn groups_by_course_with_location_lines() {
        let submissions = vec![submission("HIST 101", "Essay 1")];
        let matches = vec![matched("203.0.113.7")];
        let mut geo = BTreeMap::new();
        geo.insert(
            "203.0.113.7".to_string(),
            GeoResult {
                ip: "203.0.113.7".to_string(),
                country: "US".to_string(),
                region: "Vermont".to_string(),
                city: "Burlington".to_string(),
                organization: "Example ISP".to_string(),
                resolved_by: ResolvedBy::Primary,
            },
        );

        let summary = build_summary(
            "jdoe",
            "2025-08-26T00:00:00Z".parse().unwrap(),
            "2025-10-31T00:00:00Z".parse().unwrap(),
            &submissions,
            &matches,
            &geo,
        );

        assert!(summary.contains("# jdoe logs summary report"));
        assert!(summary.contains("## Course: HIST 101"));
        assert!(summary.contains("- Essay 1"));
        assert!(summary.contains("IP address: 203.0.113.7"));
        assert!(summary.contains("IP address location: Burlington, Vermont, US"));
        assert!(summary.contains("Match confidence: tier 1"));
    }

    #[test]
    fn empty_window_reports_no_submissions() {
        let summary = build_summary(
            "jdoe",
            "2025-08-26T00:00:00Z".parse().unwrap(),
            "2025-10-31T00:00:00Z".parse().unwrap(),
            &[],
            &[],
            &BTreeMap::new(),
        );
        assert!(summary.contains("No submissions found in this window."));
    }

    #[test]
    fn unresolved_ip_gets_empty_location() {
        let submissions = vec![submission("HIST 101", "Essay 1")];
        let matches = vec![matched("203.0.113.9")];
        let summary = build_summary(
            "jdoe",
            "2025-08-26T00:00:00Z".parse().unwrap(),
            "2025-10-31T00:00:00Z".parse().unwrap(),
            &submissions,
            &matches,
            &BTreeMap::new(),
        );
        assert!(summary.contains("IP address location: \n"));
    }
}
