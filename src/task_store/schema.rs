//! SQLite schema for the task registry.
//!
//! Version 1 holds task definitions and run history, version 2 adds the task
//! error log.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Task definitions and runs
// =============================================================================

const TASKS_TABLE_V1: Table = Table {
    name: "tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "type_name",
            &SqlType::Text,
            non_null = true,
            collate_nocase = true,
            is_unique = true
        ),
        sqlite_column!("argument", &SqlType::Text, non_null = true),
        sqlite_column!("interval", &SqlType::Text, non_null = true),
        sqlite_column!("last_executed", &SqlType::Text),
        sqlite_column!("next_executing", &SqlType::Text, non_null = true),
    ],
    indices: &[],
};

const TASK_RUNS_TABLE_V1: Table = Table {
    name: "task_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_id", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_task_runs_task_id_started", "task_id, started_at DESC"),
        ("idx_task_runs_status", "status"),
    ],
};

// =============================================================================
// Version 2 - Task error log
// =============================================================================

const TASK_ERRORS_TABLE_V2: Table = Table {
    name: "task_errors",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_name", &SqlType::Text),
        sqlite_column!("message", &SqlType::Text, non_null = true),
        sqlite_column!("occurred_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_task_errors_occurred_at", "occurred_at DESC")],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    TASK_ERRORS_TABLE_V2.create(conn)
}

pub const TASK_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[TASKS_TABLE_V1, TASK_RUNS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[TASKS_TABLE_V1, TASK_RUNS_TABLE_V1, TASK_ERRORS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
