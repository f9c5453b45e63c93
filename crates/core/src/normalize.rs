//! Rewrites of field encodings that older snapshot versions wrote differently.

use crate::catalog::PROFILE_TABLE;
use crate::record::{Record, ROLE_FIELD, STATUS_FIELD};

/// Where an unrecognized role ends up.
pub const LEAST_PRIVILEGED_ROLE: &str = "employee";

const KNOWN_STATUSES: &[&str] = &[
    "active",
    "inactive",
    "draft",
    "pending",
    "submitted",
    "approved",
    "rejected",
    "open",
    "in_progress",
    "resolved",
    "closed",
    "completed",
    "cancelled",
];

/// Returns `record` in the current canonical encoding.
///
/// Idempotent, and never fails: fields that are absent or not strings are left
/// alone, as are status values outside the known set.
pub fn normalize(table: &str, mut record: Record) -> Record {
    if table == PROFILE_TABLE {
        if let Some(role) = record.role() {
            let canonical = canonical_role(role);
            if canonical != role {
                record.set_str(ROLE_FIELD, canonical);
            }
        }
    }

    if let Some(status) = record.status() {
        if let Some(canonical) = canonical_status(status) {
            if canonical != status {
                record.set_str(STATUS_FIELD, canonical);
            }
        }
    }

    record
}

fn fold(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn canonical_role(raw: &str) -> &'static str {
    match fold(raw).as_str() {
        "admin" | "administrator" => "admin",
        "manager" => "manager",
        "tech_lead" | "techlead" | "team_lead" | "teamlead" => "tech_lead",
        "employee" | "user" | "staff" => "employee",
        _ => LEAST_PRIVILEGED_ROLE,
    }
}

fn canonical_status(raw: &str) -> Option<&'static str> {
    let folded = fold(raw);
    KNOWN_STATUSES.iter().copied().find(|s| *s == folded)
}
