//! Schedule, parameter, execution and result rows.
//!
//! Every function takes a plain `&Connection` so callers can run it inside a
//! `Transaction` (which derefs to a connection) and commit at their own
//! logical boundary.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StorageError;
use crate::network_test::iperf::SessionMetrics;
use crate::network_test::{TestDefinition, TestStatus, TestType, TrafficOptions};

type Result<T> = std::result::Result<T, StorageError>;

/// A schedule joined with its current (latest) parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub enabled: bool,
    pub cron_expr: String,
    pub params_id: i64,
    pub definition: TestDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamsRecord {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub definition: TestDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub params_id: i64,
    pub network_name: String,
    pub test_type: TestType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub id: i64,
    pub execution_id: i64,
    pub status: TestStatus,
    pub asset_name: String,
    pub src_node_mac: String,
    pub dst_node_mac: String,
    pub link_name: Option<String>,
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: SessionMetrics,
}

/// A result row written when a session is launched (or fails to launch).
#[derive(Debug, Clone)]
pub struct NewResult<'a> {
    pub execution_id: i64,
    pub asset_name: &'a str,
    pub src_node_mac: &'a str,
    pub dst_node_mac: &'a str,
    pub link_name: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub status: TestStatus,
}

/// Filters for [`list_executions`]. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<TestStatus>,
    pub network_name: Option<String>,
    pub limit: Option<u32>,
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_time(idx, &row.get::<_, String>(idx)?)
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| parse_time(idx, &value))
        .transpose()
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map `test_type, network_name, traffic_options, allow_list` starting at `idx`.
fn definition_columns(row: &Row<'_>, idx: usize) -> rusqlite::Result<TestDefinition> {
    let allow_list: Option<BTreeSet<String>> = match row.get::<_, Option<String>>(idx + 3)? {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx + 3, Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let options: TrafficOptions = json_column(row, idx + 2)?;
    Ok(TestDefinition::new(
        row.get::<_, String>(idx + 1)?,
        row.get::<_, TestType>(idx)?,
        options,
        allow_list,
    ))
}

// ---------------------------------------------------------------------------
// Schedules and parameters
// ---------------------------------------------------------------------------

pub fn insert_schedule(conn: &Connection, enabled: bool, cron_expr: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO network_test_schedule (enabled, cron_expr) VALUES (?1, ?2)",
        params![enabled, cron_expr],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_schedule(conn: &Connection, id: i64, enabled: bool, cron_expr: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE network_test_schedule
         SET enabled = ?2, cron_expr = ?3, updated_at = datetime('now')
         WHERE id = ?1",
        params![id, enabled, cron_expr],
    )?)
}

pub fn delete_schedule(conn: &Connection, id: i64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM network_test_schedule WHERE id = ?1", params![id])?)
}

pub fn insert_params(
    conn: &Connection,
    schedule_id: Option<i64>,
    definition: &TestDefinition,
) -> Result<i64> {
    let options = serde_json::to_string(&definition.options)?;
    let allow_list = definition
        .allow_list
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO network_test_params (schedule_id, test_type, network_name, traffic_options, allow_list)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            schedule_id,
            definition.test_type,
            definition.network_name,
            options,
            allow_list
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The current parameters of a schedule: the row with the highest id.
pub fn latest_params(conn: &Connection, schedule_id: i64) -> Result<Option<ParamsRecord>> {
    let record = conn
        .query_row(
            "SELECT id, schedule_id, test_type, network_name, traffic_options, allow_list
             FROM network_test_params
             WHERE schedule_id = ?1
             ORDER BY id DESC
             LIMIT 1",
            params![schedule_id],
            |row| {
                Ok(ParamsRecord {
                    id: row.get(0)?,
                    schedule_id: row.get(1)?,
                    definition: definition_columns(row, 2)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

const SCHEDULE_SELECT: &str =
    "SELECT s.id, s.enabled, s.cron_expr, p.id, p.test_type, p.network_name, p.traffic_options, p.allow_list
     FROM network_test_schedule s
     JOIN network_test_params p
       ON p.id = (SELECT MAX(id) FROM network_test_params WHERE schedule_id = s.id)";

fn map_schedule(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get(0)?,
        enabled: row.get(1)?,
        cron_expr: row.get(2)?,
        params_id: row.get(3)?,
        definition: definition_columns(row, 4)?,
    })
}

pub fn list_schedules(conn: &Connection) -> Result<Vec<ScheduleRecord>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY s.id", SCHEDULE_SELECT))?;
    let rows = stmt.query_map([], map_schedule)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn get_schedule(conn: &Connection, id: i64) -> Result<Option<ScheduleRecord>> {
    let record = conn
        .query_row(
            &format!("{} WHERE s.id = ?1", SCHEDULE_SELECT),
            params![id],
            map_schedule,
        )
        .optional()?;
    Ok(record)
}

/// Every network referenced by stored test parameters.
pub fn network_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT network_name FROM network_test_params ORDER BY network_name")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Insert a RUNNING execution. Fails with a constraint violation if the
/// network already has a RUNNING execution.
pub fn insert_execution(
    conn: &Connection,
    params_id: i64,
    network_name: &str,
    start_time: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO network_test_execution (params_id, network_name, start_time, status)
         VALUES (?1, ?2, ?3, ?4)",
        params![params_id, network_name, start_time.to_rfc3339(), TestStatus::Running],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn is_network_busy(conn: &Connection, network_name: &str) -> Result<bool> {
    let busy = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM network_test_execution e
            JOIN network_test_params p ON e.params_id = p.id
            WHERE e.status = ?1 AND p.network_name = ?2
        )",
        params![TestStatus::Running, network_name],
        |row| row.get(0),
    )?;
    Ok(busy)
}

/// Move a RUNNING execution to `status`. Returns 0 if it was already terminal.
pub fn finish_execution(
    conn: &Connection,
    id: i64,
    status: TestStatus,
    end_time: DateTime<Utc>,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE network_test_execution SET status = ?2, end_time = ?3
         WHERE id = ?1 AND status = 'RUNNING'",
        params![id, status, end_time.to_rfc3339()],
    )?)
}

const EXECUTION_SELECT: &str =
    "SELECT e.id, e.params_id, p.network_name, p.test_type, e.start_time, e.end_time, e.status
     FROM network_test_execution e
     JOIN network_test_params p ON e.params_id = p.id";

fn map_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        params_id: row.get(1)?,
        network_name: row.get(2)?,
        test_type: row.get(3)?,
        start_time: time_column(row, 4)?,
        end_time: optional_time_column(row, 5)?,
        status: row.get(6)?,
    })
}

pub fn list_executions(conn: &Connection, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR e.status = ?1) AND (?2 IS NULL OR p.network_name = ?2)
         ORDER BY e.id DESC LIMIT ?3",
        EXECUTION_SELECT
    ))?;
    let limit = filter.limit.map(i64::from).unwrap_or(-1);
    let rows = stmt.query_map(
        params![filter.status, filter.network_name, limit],
        map_execution,
    )?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn get_execution(conn: &Connection, id: i64) -> Result<Option<ExecutionRecord>> {
    let record = conn
        .query_row(
            &format!("{} WHERE e.id = ?1", EXECUTION_SELECT),
            params![id],
            map_execution,
        )
        .optional()?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

pub fn insert_result(conn: &Connection, result: &NewResult<'_>) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let end_time = result.status.is_terminal().then(|| now.clone());
    conn.execute(
        "INSERT INTO network_test_result
            (execution_id, status, asset_name, src_node_mac, dst_node_mac, link_name, session_id, start_time, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            result.execution_id,
            result.status,
            result.asset_name,
            result.src_node_mac,
            result.dst_node_mac,
            result.link_name,
            result.session_id,
            now,
            end_time
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a RUNNING result with its terminal status and any collected metrics.
pub fn finish_result(
    conn: &Connection,
    id: i64,
    status: TestStatus,
    metrics: Option<&SessionMetrics>,
    output: Option<&str>,
) -> Result<usize> {
    let m = metrics.cloned().unwrap_or_default();
    Ok(conn.execute(
        "UPDATE network_test_result
         SET status = ?2, end_time = ?3,
             throughput_min_mbps = ?4, throughput_max_mbps = ?5, throughput_avg_mbps = ?6,
             lost_percent_avg = ?7, jitter_ms_avg = ?8, retransmits = ?9, iperf_output = ?10
         WHERE id = ?1 AND status = 'RUNNING'",
        params![
            id,
            status,
            Utc::now().to_rfc3339(),
            m.throughput_min_mbps,
            m.throughput_max_mbps,
            m.throughput_avg_mbps,
            m.lost_percent_avg,
            m.jitter_ms_avg,
            m.retransmits.map(|r| r as i64),
            output
        ],
    )?)
}

/// Close every still-RUNNING result of an execution with `status`.
pub fn close_running_results(conn: &Connection, execution_id: i64, status: TestStatus) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE network_test_result SET status = ?2, end_time = ?3
         WHERE execution_id = ?1 AND status = 'RUNNING'",
        params![execution_id, status, Utc::now().to_rfc3339()],
    )?)
}

pub fn list_results(conn: &Connection, execution_id: i64) -> Result<Vec<ResultRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, execution_id, status, asset_name, src_node_mac, dst_node_mac, link_name, session_id,
                start_time, end_time, throughput_min_mbps, throughput_max_mbps, throughput_avg_mbps,
                lost_percent_avg, jitter_ms_avg, retransmits
         FROM network_test_result
         WHERE execution_id = ?1
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![execution_id], |row| {
        Ok(ResultRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            status: row.get(2)?,
            asset_name: row.get(3)?,
            src_node_mac: row.get(4)?,
            dst_node_mac: row.get(5)?,
            link_name: row.get(6)?,
            session_id: row.get(7)?,
            start_time: time_column(row, 8)?,
            end_time: optional_time_column(row, 9)?,
            metrics: SessionMetrics {
                throughput_min_mbps: row.get(10)?,
                throughput_max_mbps: row.get(11)?,
                throughput_avg_mbps: row.get(12)?,
                lost_percent_avg: row.get(13)?,
                jitter_ms_avg: row.get(14)?,
                retransmits: row.get::<_, Option<i64>>(15)?.map(|r| r as u64),
            },
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Mark every RUNNING execution and result as ABORTED.
/// Returns `(executions, results)` updated.
pub fn abort_running(conn: &Connection) -> Result<(usize, usize)> {
    let now = Utc::now().to_rfc3339();
    let executions = conn.execute(
        "UPDATE network_test_execution SET status = ?1, end_time = ?2 WHERE status = 'RUNNING'",
        params![TestStatus::Aborted, now],
    )?;
    let results = conn.execute(
        "UPDATE network_test_result SET status = ?1, end_time = ?2 WHERE status = 'RUNNING'",
        params![TestStatus::Aborted, now],
    )?;
    Ok((executions, results))
}
