//! SQLite schema definitions for the scheduler database.
//!
//! Priority groups and jobs live here, together with the continuation queue
//! used by checkpointed batch tasks and the entity key index those tasks scan.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Priority groups and jobs
// =============================================================================

const PRIORITY_GROUPS_TABLE_V1: Table = Table {
    name: "priority_groups",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("label", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_priority_groups_priority", "priority DESC")],
    unique_constraints: &[&["name"]],
};

/// Jobs are never deleted; finished and aborted rows are kept as history.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("priority_group", &SqlType::Text, non_null = true),
        sqlite_column!("task_name", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("errors", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("key_data", &SqlType::Text, non_null = true), // JSON array of strings
        sqlite_column!("text_data", &SqlType::Text),
        sqlite_column!("retry_after", &SqlType::Text),
        sqlite_column!("version", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("last_modified", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_jobs_group_status", "priority_group, status"),
        ("idx_jobs_task_name", "task_name"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - Continuation queue and entity key index
// =============================================================================

const CONTINUATIONS_TABLE_V2: Table = Table {
    name: "continuations",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("runner", &SqlType::Text, non_null = true),
        sqlite_column!("checkpoint", &SqlType::Text), // JSON, NULL on a first slice
        sqlite_column!("params", &SqlType::Text, non_null = true),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("not_before", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_continuations_not_before", "not_before")],
    unique_constraints: &[],
};

/// Keys of application entities, written by the application and only read here.
const ENTITY_KEYS_TABLE_V2: Table = Table {
    name: "entity_keys",
    columns: &[
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_entity_keys_kind_key", "kind, key")],
    unique_constraints: &[&["kind", "key"]],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    CONTINUATIONS_TABLE_V2.create(conn)?;
    ENTITY_KEYS_TABLE_V2.create(conn)?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

pub static JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[PRIORITY_GROUPS_TABLE_V1, JOBS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            PRIORITY_GROUPS_TABLE_V1,
            JOBS_TABLE_V1,
            CONTINUATIONS_TABLE_V2,
            ENTITY_KEYS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
