//! Database schema and migrations.

use rusqlite::{params, Connection, Result};

/// Version recorded once the tables below exist.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS network_test_schedule (
            id INTEGER PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            cron_expr TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS network_test_params (
            id INTEGER PRIMARY KEY,
            schedule_id INTEGER REFERENCES network_test_schedule(id) ON DELETE SET NULL,
            test_type TEXT NOT NULL,
            network_name TEXT NOT NULL,
            traffic_options TEXT NOT NULL,
            allow_list TEXT
        );

        CREATE TABLE IF NOT EXISTS network_test_execution (
            id INTEGER PRIMARY KEY,
            params_id INTEGER NOT NULL REFERENCES network_test_params(id),
            network_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS network_test_result (
            id INTEGER PRIMARY KEY,
            execution_id INTEGER NOT NULL REFERENCES network_test_execution(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            asset_name TEXT NOT NULL,
            src_node_mac TEXT NOT NULL,
            dst_node_mac TEXT NOT NULL,
            link_name TEXT,
            session_id TEXT,
            start_time TEXT NOT NULL,
            end_time TEXT,
            throughput_min_mbps REAL,
            throughput_max_mbps REAL,
            throughput_avg_mbps REAL,
            lost_percent_avg REAL,
            jitter_ms_avg REAL,
            retransmits INTEGER,
            iperf_output TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_params_schedule ON network_test_params(schedule_id);
        CREATE INDEX IF NOT EXISTS idx_params_network ON network_test_params(network_name);
        CREATE INDEX IF NOT EXISTS idx_execution_status ON network_test_execution(status);
        CREATE INDEX IF NOT EXISTS idx_result_execution ON network_test_result(execution_id);
        CREATE INDEX IF NOT EXISTS idx_result_status ON network_test_result(status);

        -- At most one RUNNING execution per network.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_execution_running_network
            ON network_test_execution(network_name) WHERE status = 'RUNNING';",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}
