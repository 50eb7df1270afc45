use rusqlite::{params, Connection, OptionalExtension};

pub fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Insert `value` only if `key` has no value yet. Returns `true` if inserted.
pub fn set_default(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let conn = crate::open_in_memory().unwrap();
        assert_eq!(get(&conn, "terminal.nope").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let conn = crate::open_in_memory().unwrap();
        set(&conn, "terminal.default_cols", "100").unwrap();
        set(&conn, "terminal.default_cols", "132").unwrap();
        assert_eq!(
            get(&conn, "terminal.default_cols").unwrap().as_deref(),
            Some("132")
        );
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let conn = crate::open_in_memory().unwrap();
        assert!(set_default(&conn, "terminal.default_rows", "40").unwrap());
        assert!(!set_default(&conn, "terminal.default_rows", "50").unwrap());
        assert_eq!(
            get(&conn, "terminal.default_rows").unwrap().as_deref(),
            Some("40")
        );
    }
}
