use anyhow::Context;
use rusqlite::Connection;

// Migrations are embedded so in-memory databases (tests) get the schema
// without a migrations directory on disk.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_bookings",
    "CREATE TABLE IF NOT EXISTS bookings (
        id TEXT PRIMARY KEY,
        customer_name TEXT NOT NULL,
        customer_email TEXT NOT NULL,
        customer_phone TEXT,
        appointment_time TEXT NOT NULL,
        service_type TEXT NOT NULL,
        addons TEXT NOT NULL DEFAULT '[]',
        mobile_service INTEGER NOT NULL DEFAULT 0,
        total_price_cents INTEGER NOT NULL,
        deposit_cents INTEGER NOT NULL,
        payment_reference TEXT NOT NULL,
        management_token TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'confirmed',
        payment_status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_payment_reference
        ON bookings(payment_reference);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_management_token
        ON bookings(management_token);
    CREATE INDEX IF NOT EXISTS idx_bookings_appointment_time
        ON bookings(appointment_time);",
)];

pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .context("failed to create migrations table")?;

    for (name, sql) in MIGRATIONS {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .context("failed to check migration status")?;

        if already_applied {
            continue;
        }

        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration: {name}"))?;

        conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])
            .with_context(|| format!("failed to record migration: {name}"))?;

        tracing::info!("applied migration: {name}");
    }

    Ok(())
}
