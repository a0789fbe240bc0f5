use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{ActivityRecord, SubmissionRecord};

/// Fetch one user's page views for a bounded time range, oldest first.
///
/// Canvas stores timestamps as UTC without a zone; `AT TIME ZONE 'UTC'` makes
/// the comparison and the returned column timezone-aware. The assignment id is
/// only known when the viewed asset is an assignment.
pub async fn fetch_activity(
    pool: &PgPool,
    username: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<ActivityRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT
            pv.created_at AT TIME ZONE 'UTC' AS created_at,
            pv.user_id,
            pv.remote_ip,
            pv.http_method,
            pv.http_status,
            pv.url,
            pv.user_agent,
            pv.session_id,
            pv.controller,
            pv.action,
            pv.context_type,
            pv.context_id,
            CASE WHEN pv.asset_type = 'Assignment' THEN pv.asset_id END AS assignment_id,
            COALESCE(pv.participated, FALSE) AS participated
        FROM page_views pv
        JOIN pseudonyms p ON p.user_id = pv.user_id
        WHERE p.unique_id = $1
          AND pv.created_at AT TIME ZONE 'UTC' >= $2
          AND pv.created_at AT TIME ZONE 'UTC' < $3
        ORDER BY pv.created_at
        "#,
    )
    .bind(username)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::new();
    for row in rows {
        records.push(ActivityRecord {
            timestamp: row.get("created_at"),
            user_id: row.get("user_id"),
            remote_ip: row.get("remote_ip"),
            http_method: row.get("http_method"),
            http_status: row.get("http_status"),
            url: row.get("url"),
            user_agent: row.get("user_agent"),
            session_id: row.get("session_id"),
            controller: row.get("controller"),
            action: row.get("action"),
            context_type: row.get("context_type"),
            context_id: row.get("context_id"),
            assignment_id: row.get("assignment_id"),
            participated: row.get("participated"),
        });
    }

    Ok(records)
}

/// Fetch one user's submitted and graded submissions for a bounded time range.
pub async fn fetch_submissions(
    pool: &PgPool,
    username: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<SubmissionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT
            s.user_id,
            s.assignment_id,
            a.title AS assignment_name,
            c.name AS course_name,
            s.attempt,
            s.submitted_at AT TIME ZONE 'UTC' AS submitted_at,
            s.workflow_state,
            s.submission_type,
            s.score,
            s.graded_at AT TIME ZONE 'UTC' AS graded_at
        FROM submissions s
        JOIN assignments a ON a.id = s.assignment_id
        JOIN courses c ON c.id = a.context_id
        JOIN pseudonyms p ON p.user_id = s.user_id
        WHERE p.unique_id = $1
          AND s.workflow_state IN ('submitted', 'graded')
          AND s.submitted_at AT TIME ZONE 'UTC' >= $2
          AND s.submitted_at AT TIME ZONE 'UTC' < $3
        ORDER BY s.submitted_at
        "#,
    )
    .bind(username)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::new();
    for row in rows {
        records.push(SubmissionRecord {
            user_id: row.get("user_id"),
            assignment_id: row.get("assignment_id"),
            assignment_name: row.get("assignment_name"),
            course_name: row.get("course_name"),
            attempt: row.get("attempt"),
            submitted_at: row.get("submitted_at"),
            workflow_state: row.get("workflow_state"),
            submission_type: row.get("submission_type"),
            score: row.get("score"),
            graded_at: row.get("graded_at"),
        });
    }

    Ok(records)
}
