//! Duplicate ignore-list repository.

use std::collections::HashSet;

use rusqlite::params;

use super::{format_timestamp, Database, DatabaseError};

/// Builds the order-independent key for a pair of catalog ids.
pub fn pair_key(id1: i64, id2: i64) -> String {
    format!("{}:{}", id1.min(id2), id1.max(id2))
}

/// Records a pair as a confirmed non-duplicate. Returns false if the pair
/// was already ignored.
pub fn insert(db: &Database, id1: i64, id2: i64) -> Result<bool, DatabaseError> {
    let now = format_timestamp(chrono::Utc::now());
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO duplicate_ignores (pair_key, video_id_a, video_id_b, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![pair_key(id1, id2), id1.min(id2), id1.max(id2), now],
        )?;
        Ok(inserted == 1)
    })
}

/// Loads every ignored pair key.
pub fn all_keys(db: &Database) -> Result<HashSet<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT pair_key FROM duplicate_ignores")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key(7, 3), "3:7");
        assert_eq!(pair_key(3, 7), "3:7");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        assert!(insert(&db, 4, 2).unwrap());
        assert!(!insert(&db, 2, 4).unwrap());

        let keys = all_keys(&db).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("2:4"));
    }
}
