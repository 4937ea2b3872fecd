mod test_support;

use diesel::RunQueryDsl;
use test_support::TEST_POOL;

#[test]
fn migrations_create_tables_and_status_check() {
    let Some(pool) = TEST_POOL.as_ref() else {
        eprintln!("skip migrations_create_tables_and_status_check (no DATABASE_URL)");
        return;
    };
    let mut conn = pool.get().expect("conn");
    for table in ["workflows", "jobs", "job_steps", "schedules", "event_subscriptions", "queue_jobs",
                  "queue_recurring", "queue_state"]
    {
        diesel::sql_query(format!("SELECT 1 FROM {table} LIMIT 1")).execute(&mut conn)
                                                                  .unwrap_or_else(|e| panic!("{table}: {e}"));
    }
    // Un estado fuera del enum lo rechaza la CHECK de la tabla.
    let bad = diesel::sql_query("INSERT INTO queue_jobs (queue, id, message, state) \
                                 VALUES ('smoke', gen_random_uuid()::text, 'null', 'sleeping')")
              .execute(&mut conn);
    assert!(bad.is_err());
}
