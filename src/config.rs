use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::services::avatar_service::AvatarSettings;

const ENV_PREFIX: &str = "AVATARS_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub storage: StorageConfig,
    pub avatars: AvatarSettings,
}

/// Where objects live.
#[derive(Clone)]
pub enum StorageConfig {
    /// Objects on local disk; this process serves the presigned endpoints.
    Local {
        dir: PathBuf,
        bucket: String,
        /// Externally reachable base URL of this service, used in credentials.
        public_url: String,
        signing_secret: String,
    },
    /// An S3-compatible service.
    S3(S3Config),
}

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Path-style URLs (`endpoint/bucket/key`), required by MinIO.
    pub force_path_style: bool,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfig::Local {
                dir,
                bucket,
                public_url,
                ..
            } => f
                .debug_struct("Local")
                .field("dir", dir)
                .field("bucket", bucket)
                .field("public_url", public_url)
                .field("signing_secret", &"<redacted>")
                .finish(),
            StorageConfig::S3(s3) => f.debug_tuple("S3").field(s3).finish(),
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Avatar upload and reconciliation API")]
pub struct Args {
    /// Host to bind to (overrides AVATARS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides AVATARS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides AVATARS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `s3` (overrides AVATARS_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Directory for the local backend (overrides AVATARS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket name (overrides AVATARS_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values produced by `lookup` (an environment).
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "PORT", 8080u16)?,
        };
        let bucket = args
            .bucket
            .or_else(|| var("BUCKET"))
            .unwrap_or_else(|| "avatars".into());

        let backend = args
            .storage_backend
            .or_else(|| var("STORAGE_BACKEND"))
            .unwrap_or_else(|| "local".into());

        let storage = match backend.to_ascii_lowercase().as_str() {
            "local" => StorageConfig::Local {
                dir: args
                    .storage_dir
                    .or_else(|| var("STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/objects".into())
                    .into(),
                bucket,
                public_url: var("PUBLIC_URL")
                    .unwrap_or_else(|| format!("http://localhost:{port}"))
                    .trim_end_matches('/')
                    .to_string(),
                signing_secret: var("LOCAL_SIGNING_SECRET")
                    .unwrap_or_else(|| "local-development-secret".into()),
            },
            "s3" => {
                let access_key_id = var("S3_ACCESS_KEY_ID");
                let secret_access_key = var("S3_SECRET_ACCESS_KEY");
                if access_key_id.is_some() != secret_access_key.is_some() {
                    bail!(
                        "{ENV_PREFIX}S3_ACCESS_KEY_ID and {ENV_PREFIX}S3_SECRET_ACCESS_KEY must be set together"
                    );
                }
                StorageConfig::S3(S3Config {
                    bucket,
                    endpoint: var("S3_ENDPOINT"),
                    region: var("S3_REGION"),
                    access_key_id,
                    secret_access_key,
                    force_path_style: parse_var(&var, "S3_FORCE_PATH_STYLE", false)?,
                })
            }
            other => bail!("unknown storage backend `{other}` (expected `local` or `s3`)"),
        };

        let defaults = AvatarSettings::default();
        let avatars = AvatarSettings {
            credential_ttl: Duration::from_secs(parse_var(
                &var,
                "UPLOAD_CREDENTIAL_TTL_SECS",
                defaults.credential_ttl.as_secs(),
            )?),
            pending_ttl: Duration::from_secs(parse_var(
                &var,
                "PENDING_UPLOAD_TTL_SECS",
                defaults.pending_ttl.as_secs(),
            )?),
            avatar_url_ttl: Duration::from_secs(parse_var(
                &var,
                "AVATAR_URL_TTL_SECS",
                defaults.avatar_url_ttl.as_secs(),
            )?),
            max_avatar_bytes: parse_var(&var, "MAX_AVATAR_BYTES", defaults.max_avatar_bytes)?,
            storage_timeout: Duration::from_millis(parse_var(
                &var,
                "STORAGE_TIMEOUT_MS",
                defaults.storage_timeout.as_millis() as u64,
            )?),
        };
        if avatars.max_avatar_bytes == 0 {
            bail!("{ENV_PREFIX}MAX_AVATAR_BYTES must be at least 1");
        }
        if avatars.storage_timeout.is_zero() {
            bail!("{ENV_PREFIX}STORAGE_TIMEOUT_MS must be positive");
        }

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/avatars.db".into()),
            db_max_connections: parse_var(&var, "DB_MAX_CONNECTIONS", 5u32)?,
            storage,
            avatars,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`")),
        None => Ok(default),
    }
}
