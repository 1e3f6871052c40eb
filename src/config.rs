use crate::{
    models::extension::{Extension, ExtensionSet},
    state::TusSettings,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

/// Which upload backend to run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Payload files on disk plus a SQLite configstore.
    File,
    /// Everything in process memory; lost on restart.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub base_path: String,
    pub backend: Backend,
    pub max_size: Option<u64>,
    pub expiration_secs: Option<u64>,
    pub disabled_extensions: Vec<Extension>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "tus resumable upload server")]
pub struct Args {
    /// Host to bind to (overrides TUS_SERVER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_SERVER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides TUS_SERVER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Configstore database URL (overrides TUS_SERVER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Path uploads are served under (overrides TUS_SERVER_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<String>,

    /// Storage backend (overrides TUS_SERVER_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Largest upload accepted, in bytes (overrides TUS_SERVER_MAX_SIZE)
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Seconds an incomplete upload is kept before it expires (overrides TUS_SERVER_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<u64>,

    /// Extensions to switch off, comma separated (overrides TUS_SERVER_DISABLED_EXTENSIONS)
    #[arg(long, value_delimiter = ',')]
    pub disable_extension: Vec<Extension>,

    /// Apply the configstore schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Merge parsed CLI arguments over environment fallbacks.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("TUS_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed::<u16>("TUS_SERVER_PORT")?.unwrap_or(1080);
        let env_storage =
            env::var("TUS_SERVER_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("TUS_SERVER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/configstore.db".into());
        let env_base = env::var("TUS_SERVER_BASE_PATH").unwrap_or_else(|_| "/files".into());
        let env_backend = match env::var("TUS_SERVER_BACKEND") {
            Ok(value) => <Backend as ValueEnum>::from_str(&value, true)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing TUS_SERVER_BACKEND value `{}`", value))?,
            Err(_) => Backend::File,
        };
        let env_max_size = env_parsed::<u64>("TUS_SERVER_MAX_SIZE")?;
        let env_expiration = env_parsed::<u64>("TUS_SERVER_EXPIRATION_SECS")?;
        let env_disabled = match env::var("TUS_SERVER_DISABLED_EXTENSIONS") {
            Ok(value) => value
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Extension::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)?,
            Err(_) => Vec::new(),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_path: args.base_path.unwrap_or(env_base),
            backend: args.backend.unwrap_or(env_backend),
            max_size: args.max_size.or(env_max_size),
            expiration_secs: args.expiration_secs.or(env_expiration),
            disabled_extensions: if args.disable_extension.is_empty() {
                env_disabled
            } else {
                args.disable_extension
            },
        };

        if cfg.expiration_secs == Some(0) {
            bail!("expiration must be at least one second");
        }
        if cfg.disabled_extensions.contains(&Extension::Creation) {
            bail!("the creation extension cannot be disabled");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Protocol settings handed to the handlers.
    pub fn tus_settings(&self) -> TusSettings {
        let mut extensions = ExtensionSet::default();
        for ext in &self.disabled_extensions {
            extensions = extensions.without(*ext);
        }

        let mut settings = TusSettings::new(&self.base_path).with_extensions(extensions);
        if let Some(max) = self.max_size {
            settings = settings.with_max_size(max);
        }
        if let Some(secs) = self.expiration_secs {
            settings = settings.with_expiration(chrono::Duration::seconds(secs as i64));
        }
        settings
    }
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
