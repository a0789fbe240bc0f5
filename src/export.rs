use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::models::{ActivityRecord, GeoResult, MatchResult, SubmissionRecord};

const GEO_HEADERS: [&str; 4] = ["country", "region", "city", "isp"];

/// Write the activity sheet with geolocation columns placed after the IP.
pub fn write_activity_csv(
    path: &Path,
    activity: &[ActivityRecord],
    geo: &BTreeMap<String, GeoResult>,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_activity(&mut writer, activity, geo)
}

fn write_activity<W: Write>(
    writer: &mut csv::Writer<W>,
    activity: &[ActivityRecord],
    geo: &BTreeMap<String, GeoResult>,
) -> anyhow::Result<()> {
    let mut header = vec!["log_time", "user_id", "remote_ip"];
    header.extend(GEO_HEADERS);
    header.extend([
        "http_method",
        "http_status",
        "url",
        "user_agent",
        "session_id",
        "controller",
        "action",
        "context_type",
        "context_id",
        "assignment_id",
        "participated",
    ]);
    writer.write_record(&header)?;

    for record in activity {
        let location = lookup_geo(geo, record.remote_ip.as_deref());
        writer.write_record([
            fmt_ts(Some(record.timestamp)),
            record.user_id.to_string(),
            opt_str(record.remote_ip.as_deref()),
            location.country.clone(),
            location.region.clone(),
            location.city.clone(),
            location.organization.clone(),
            opt_str(record.http_method.as_deref()),
            opt_num(record.http_status.map(i64::from)),
            opt_str(record.url.as_deref()),
            opt_str(record.user_agent.as_deref()),
            opt_str(record.session_id.as_deref()),
            opt_str(record.controller.as_deref()),
            opt_str(record.action.as_deref()),
            opt_str(record.context_type.as_deref()),
            opt_num(record.context_id),
            opt_num(record.assignment_id),
            record.participated.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Write the submissions sheet with forensic columns from the matched activity
/// row and geolocation for the IP at submit time.
///
/// `matches` must be the correlation output for `submissions`, in order.
pub fn write_submissions_csv(
    path: &Path,
    submissions: &[SubmissionRecord],
    matches: &[MatchResult],
    geo: &BTreeMap<String, GeoResult>,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_submissions(&mut writer, submissions, matches, geo)
}

fn write_submissions<W: Write>(
    writer: &mut csv::Writer<W>,
    submissions: &[SubmissionRecord],
    matches: &[MatchResult],
    geo: &BTreeMap<String, GeoResult>,
) -> anyhow::Result<()> {
    let mut header = vec![
        "course",
        "assignment",
        "user_id",
        "assignment_id",
        "attempt",
        "submitted_at",
        "workflow_state",
        "submission_type",
        "score",
        "graded_at",
        "match_tier",
        "ip_at_submit",
    ];
    header.extend(GEO_HEADERS);
    header.extend([
        "url_at_submit",
        "http_method",
        "http_status",
        "controller",
        "action",
        "user_agent",
        "log_time",
    ]);
    writer.write_record(&header)?;

    for (submission, result) in submissions.iter().zip(matches.iter()) {
        let matched = result.matched_activity.as_ref();
        let ip_at_submit = matched.and_then(|m| m.remote_ip.as_deref());
        let location = lookup_geo(geo, ip_at_submit);
        writer.write_record([
            submission.course_name.clone(),
            submission.assignment_name.clone(),
            submission.user_id.to_string(),
            submission.assignment_id.to_string(),
            opt_num(submission.attempt),
            fmt_ts(submission.submitted_at),
            submission.workflow_state.clone(),
            opt_str(submission.submission_type.as_deref()),
            submission
                .score
                .map(|s| s.to_string())
                .unwrap_or_default(),
            fmt_ts(submission.graded_at),
            result
                .tier
                .map(|t| t.rank().to_string())
                .unwrap_or_default(),
            opt_str(ip_at_submit),
            location.country.clone(),
            location.region.clone(),
            location.city.clone(),
            location.organization.clone(),
            opt_str(matched.and_then(|m| m.url.as_deref())),
            opt_str(matched.and_then(|m| m.http_method.as_deref())),
            opt_num(matched.and_then(|m| m.http_status.map(i64::from))),
            opt_str(matched.and_then(|m| m.controller.as_deref())),
            opt_str(matched.and_then(|m| m.action.as_deref())),
            opt_str(matched.and_then(|m| m.user_agent.as_deref())),
            fmt_ts(matched.map(|m| m.timestamp)),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn lookup_geo<'a>(geo: &'a BTreeMap<String, GeoResult>, ip: Option<&str>) -> &'a GeoResult {
    static EMPTY: std::sync::OnceLock<GeoResult> = std::sync::OnceLock::new();
    let empty = EMPTY.get_or_init(|| GeoResult::unresolved(""));
    match ip {
        Some(ip) => geo.get(ip).unwrap_or(empty),
        None => empty,
    }
}

pub fn fmt_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn opt_str(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn opt_num(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
