//! Upserts and loads for moderation [`Report`] records.

use rusqlite::{params, Connection, OptionalExtension};

use duolog_shared::{AnonId, Report, ReportId, ReportStatus, SessionId};

use crate::codec;
use crate::error::Result;

const SELECT_REPORT: &str = "SELECT report_id, reporter_anon_id, reported_anon_id, session_id,
                                    reason, created_at, status, admin_notes
                             FROM reports";

/// Insert a report, or update its review fields if it already exists.
pub fn upsert_report(conn: &Connection, report: &Report) -> Result<()> {
    conn.execute(
        "INSERT INTO reports (report_id, reporter_anon_id, reported_anon_id, session_id,
                              reason, created_at, status, admin_notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(report_id) DO UPDATE SET
             status = excluded.status,
             admin_notes = excluded.admin_notes",
        params![
            report.report_id.as_str(),
            report.reporter_anon_id.as_str(),
            report.reported_anon_id.as_str(),
            report.session_id.as_str(),
            report.reason,
            report.created_at.to_rfc3339(),
            report.status.as_str(),
            report.admin_notes,
        ],
    )?;
    Ok(())
}

/// Reports ordered oldest first, optionally filtered by status.
pub fn load_reports(conn: &Connection, status: Option<ReportStatus>) -> Result<Vec<Report>> {
    let mut reports = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_REPORT} WHERE status = ?1 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], row_to_report)?;
            for row in rows {
                reports.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!("{SELECT_REPORT} ORDER BY created_at ASC"))?;
            let rows = stmt.query_map([], row_to_report)?;
            for row in rows {
                reports.push(row?);
            }
        }
    }
    Ok(reports)
}

pub fn get_report(conn: &Connection, report_id: &ReportId) -> Result<Option<Report>> {
    let report = conn
        .query_row(
            &format!("{SELECT_REPORT} WHERE report_id = ?1"),
            params![report_id.as_str()],
            row_to_report,
        )
        .optional()?;
    Ok(report)
}

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
    let report_id: String = row.get(0)?;
    let reporter: String = row.get(1)?;
    let reported: String = row.get(2)?;
    let session_id: String = row.get(3)?;
    let created: String = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(Report {
        report_id: ReportId::new(report_id),
        reporter_anon_id: AnonId::new(reporter),
        reported_anon_id: AnonId::new(reported),
        session_id: SessionId::new(session_id),
        reason: row.get(4)?,
        created_at: codec::timestamp(5, &created)?,
        status: codec::parse(6, &status)?,
        admin_notes: row.get(7)?,
    })
}
