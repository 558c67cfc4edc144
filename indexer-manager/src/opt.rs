use crate::worker::OnFailure;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "runner",
    about = "Runs indexer functions over block streams",
    version = "0.1"
)]
pub struct Opt {
    #[structopt(long, default_value = "localhost", value_name = "HOST", env = "PGHOST")]
    pub pg_host: String,
    #[structopt(long, default_value = "5432", value_name = "PORT", env = "PGPORT")]
    pub pg_port: u16,
    #[structopt(long, default_value = "postgres", value_name = "USER", env = "PGUSER")]
    pub pg_user: String,
    #[structopt(
        long,
        default_value = "postgres",
        value_name = "PASSWORD",
        env = "PGPASSWORD",
        hide_env_values = true
    )]
    pub pg_password: String,
    #[structopt(
        long,
        default_value = "postgres",
        value_name = "DATABASE",
        env = "PGDATABASE",
        help = "Default database of the cluster, used for creating tenant databases and roles"
    )]
    pub pg_database: String,
    #[structopt(
        long,
        default_value = "postgres",
        value_name = "DATABASE",
        env = "CRON_DATABASE",
        help = "Database pg_cron is installed in"
    )]
    pub cron_database: String,
    #[structopt(
        long,
        default_value = "5",
        value_name = "SIZE",
        env = "CONNECTION_POOL_SIZE",
        help = "Size of each admin connection pool"
    )]
    pub pool_size: u32,
    #[structopt(
        long,
        default_value = "http://localhost:8080",
        value_name = "URL",
        env = "HASURA_ENDPOINT"
    )]
    pub hasura_endpoint: String,
    #[structopt(
        long,
        default_value = "",
        value_name = "SECRET",
        env = "HASURA_ADMIN_SECRET",
        hide_env_values = true
    )]
    pub hasura_admin_secret: String,
    #[structopt(
        long,
        value_name = "HOST",
        env = "PGHOST_PGBOUNCER",
        help = "Host tenants connect through instead of PGHOST"
    )]
    pub pg_bouncer_host: Option<String>,
    #[structopt(long, value_name = "PORT", env = "PGPORT_PGBOUNCER")]
    pub pg_bouncer_port: Option<u16>,
    #[structopt(
        long,
        default_value = "redis://127.0.0.1/",
        value_name = "URL",
        env = "REDIS_CONNECTION_STRING"
    )]
    pub redis_connection_string: String,
    #[structopt(
        long,
        default_value = "9180",
        value_name = "PORT",
        env = "PORT",
        help = "Port serving /metrics"
    )]
    pub port: u16,
    #[structopt(
        long,
        default_value = "false",
        value_name = "BOOL",
        env = "GCP_LOGGING_ENABLED",
        parse(try_from_str),
        help = "Log one JSON object per line"
    )]
    pub gcp_logging_enabled: bool,
    #[structopt(
        long,
        default_value = "https://api.near.social",
        value_name = "URL",
        env = "SOCIAL_API_URL"
    )]
    pub social_api_url: String,
    #[structopt(
        long,
        value_name = "URL",
        env = "BLOCK_SERVER_URL",
        help = "Serves `<url>/<height>` for stream entries without a streamer message"
    )]
    pub block_server_url: Option<String>,
    #[structopt(
        long,
        default_value = "30000",
        value_name = "MS",
        env = "EXECUTION_TIMEOUT_MS",
        help = "Wall-clock budget of one execution"
    )]
    pub execution_timeout_ms: u64,
    #[structopt(
        long,
        default_value = "retry",
        value_name = "POLICY",
        env = "ON_FAILURE",
        possible_values = &["retry", "skip"],
        help = "retry: keep retrying a failed block; skip: move past it"
    )]
    pub on_failure: OnFailure,
    #[structopt(long, default_value = "3", value_name = "COUNT", env = "PROVISIONING_MAX_RETRIES")]
    pub provisioning_max_retries: u32,
    #[structopt(long, default_value = "1000", value_name = "MS", env = "PROVISIONING_BASE_DELAY_MS")]
    pub provisioning_base_delay_ms: u64,
    #[structopt(long, default_value = "100", value_name = "MS", env = "STREAM_POLL_INTERVAL_MS")]
    pub stream_poll_interval_ms: u64,
}

impl Opt {
    pub fn admin_database_url(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.pg_user, self.pg_password, self.pg_host, self.pg_port, database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works_on_defaults_and_flags() {
        let opt = Opt::from_iter_safe(&[
            "runner",
            "--pg-host",
            "db",
            "--pg-port",
            "5432",
            "--pg-user",
            "postgres",
            "--pg-password",
            "postgres",
            "--on-failure",
            "skip",
            "--pg-bouncer-port",
            "6432",
        ])
        .unwrap();
        assert_eq!(OnFailure::Skip, opt.on_failure);
        assert_eq!(Some(6432), opt.pg_bouncer_port);
        assert_eq!("postgres://postgres:postgres@db:5432/postgres", opt.admin_database_url("postgres"));
    }
}
