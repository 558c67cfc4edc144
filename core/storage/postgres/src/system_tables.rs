//! DDL for the tables every indexer schema carries next to the user tables.
//! The statements are unqualified and expect the indexer schema on the
//! search path.
use indexer_common::consts::{LOGS_TABLE_NAME, METADATA_TABLE_NAME};
use indexer_common::util::sql::{quote_ident, quote_literal};

/// Partition ahead for tomorrow at 01:00, drop the partition two weeks back
/// at 02:00.
const CREATE_PARTITION_SCHEDULE: &str = "0 1 * * *";
const DELETE_PARTITION_SCHEDULE: &str = "0 2 * * *";

pub fn metadata_table_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (attribute TEXT NOT NULL PRIMARY KEY, value TEXT NOT NULL);",
        METADATA_TABLE_NAME
    )
}

/// `sys_logs` partitioned by day, its indexes, the partition management
/// functions, and partitions for today and tomorrow.
pub fn logs_table_ddl(schema_name: &str) -> String {
    let logs = LOGS_TABLE_NAME;
    let qualified = quote_literal(&format!("{}.{}", quote_ident(schema_name), logs));
    format!(
        r#"CREATE TABLE IF NOT EXISTS {logs} (
  id BIGSERIAL NOT NULL,
  block_height NUMERIC(20),
  date DATE NOT NULL,
  timestamp TIMESTAMP NOT NULL,
  type TEXT NOT NULL,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  PRIMARY KEY (date, id)
) PARTITION BY RANGE (date);

CREATE INDEX IF NOT EXISTS {logs}_timestamp_idx ON {logs} USING btree (timestamp);
CREATE INDEX IF NOT EXISTS {logs}_type_idx ON {logs} USING btree (type);
CREATE INDEX IF NOT EXISTS {logs}_level_idx ON {logs} USING btree (level);
CREATE INDEX IF NOT EXISTS {logs}_block_height_idx ON {logs} USING btree (block_height);
CREATE INDEX IF NOT EXISTS {logs}_search_vector_idx ON {logs} USING GIN (to_tsvector('english', message));

CREATE OR REPLACE FUNCTION fn_create_partition(_tbl text, _date date, _interval_start text, _interval_end text)
RETURNS void
LANGUAGE plpgsql AS
$func$
DECLARE
  _start text;
  _end text;
  _partition_name text;
BEGIN
  _start := TO_CHAR(_date + _interval_start::interval, 'YYYY-MM-DD');
  _end := TO_CHAR(_date + _interval_end::interval, 'YYYY-MM-DD');
  _partition_name := TO_CHAR(_date + _interval_start::interval, 'YYYYMMDD');
  EXECUTE 'CREATE TABLE IF NOT EXISTS ' || _tbl || '_p' || _partition_name || ' PARTITION OF ' || _tbl || ' FOR VALUES FROM (''' || _start || ''') TO (''' || _end || ''')';
END
$func$;

CREATE OR REPLACE FUNCTION fn_delete_partition(_tbl text, _date date, _interval_start text, _interval_end text)
RETURNS void
LANGUAGE plpgsql AS
$func$
DECLARE
  _partition_name text;
BEGIN
  _partition_name := TO_CHAR(_date + _interval_start::interval, 'YYYYMMDD');
  EXECUTE 'DROP TABLE IF EXISTS ' || _tbl || '_p' || _partition_name;
END
$func$;

SELECT fn_create_partition({qualified}, CURRENT_DATE, '0 day', '1 day');
SELECT fn_create_partition({qualified}, CURRENT_DATE, '1 day', '2 day');
"#,
        logs = logs,
        qualified = qualified,
    )
}

/// `cron.schedule_in_database` calls registering both partition jobs, to be
/// run on the cron database as the tenant role.
pub fn schedule_partition_jobs_sql(
    create_job: &str,
    delete_job: &str,
    schema_name: &str,
    database_name: &str,
) -> String {
    let qualified = quote_literal(&format!("{}.{}", quote_ident(schema_name), LOGS_TABLE_NAME));
    let create_command = format!(
        "SELECT {}.fn_create_partition({}, CURRENT_DATE, '1 day', '2 day')",
        quote_ident(schema_name),
        qualified
    );
    let delete_command = format!(
        "SELECT {}.fn_delete_partition({}, CURRENT_DATE, '-15 day', '-14 day')",
        quote_ident(schema_name),
        qualified
    );
    format!(
        "SELECT cron.schedule_in_database({}, {}, {}, {});\nSELECT cron.schedule_in_database({}, {}, {}, {});",
        quote_literal(create_job),
        quote_literal(CREATE_PARTITION_SCHEDULE),
        quote_literal(&create_command),
        quote_literal(database_name),
        quote_literal(delete_job),
        quote_literal(DELETE_PARTITION_SCHEDULE),
        quote_literal(&delete_command),
        quote_literal(database_name),
    )
}

/// Removes a cron job if it exists. Missing jobs are not an error.
pub fn unschedule_job_sql(job_name: &str) -> String {
    format!(
        "SELECT cron.unschedule(jobid) FROM cron.job WHERE jobname = {};",
        quote_literal(job_name)
    )
}
