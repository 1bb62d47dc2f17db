//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    fmt,
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CliArgs, Command, RenderOverrides, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "texshot";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_BODY_BYTES: u64 = 1 << 20;
const DEFAULT_DPI: u32 = 150;
const MIN_DPI: u32 = 36;
const MAX_DPI: u32 = 1200;
pub(crate) const DEFAULT_PDFLATEX_PATH: &str = "pdflatex";
pub(crate) const DEFAULT_PDFCROP_PATH: &str = "pdfcrop";
pub(crate) const DEFAULT_PDFTOPPM_PATH: &str = "pdftoppm";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub read_timeout: Duration,
    pub read_header_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Shared secret for the render endpoint. `None` leaves the endpoint open.
#[derive(Clone, Default)]
pub struct AuthSettings {
    pub api_key: Option<String>,
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub worker_limit: NonZeroUsize,
    pub max_body_bytes: NonZeroU64,
    pub command_timeout: Duration,
    pub allow_shell_escape: bool,
    pub dpi: u32,
    pub pdflatex_path: PathBuf,
    pub pdfcrop_path: PathBuf,
    pub pdftoppm_path: PathBuf,
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TEXSHOT").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    auth: RawAuthSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(value) = overrides.read_timeout.as_ref() {
            self.server.read_timeout = Some(value.clone());
        }
        if let Some(value) = overrides.read_header_timeout.as_ref() {
            self.server.read_header_timeout = Some(value.clone());
        }
        if let Some(value) = overrides.write_timeout.as_ref() {
            self.server.write_timeout = Some(value.clone());
        }
        if let Some(value) = overrides.idle_timeout.as_ref() {
            self.server.idle_timeout = Some(value.clone());
        }
        if let Some(value) = overrides.graceful_shutdown.as_ref() {
            self.server.graceful_shutdown = Some(value.clone());
        }
        if let Some(key) = overrides.api_key.as_ref() {
            self.auth.api_key = Some(key.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(limit) = overrides.worker_limit {
            self.render.worker_limit = Some(limit);
        }
        if let Some(bytes) = overrides.max_body_bytes {
            self.render.max_body_bytes = Some(bytes);
        }
        if let Some(timeout) = overrides.command_timeout.as_ref() {
            self.render.command_timeout = Some(timeout.clone());
        }
        if let Some(allow) = overrides.allow_shell_escape {
            self.render.allow_shell_escape = Some(allow);
        }
        if let Some(dpi) = overrides.dpi {
            self.render.dpi = Some(dpi);
        }
        if let Some(path) = overrides.pdflatex_path.as_ref() {
            self.render.pdflatex_path = Some(path.clone());
        }
        if let Some(path) = overrides.pdfcrop_path.as_ref() {
            self.render.pdfcrop_path = Some(path.clone());
        }
        if let Some(path) = overrides.pdftoppm_path.as_ref() {
            self.render.pdftoppm_path = Some(path.clone());
        }
        if let Some(root) = overrides.workspace_root.as_ref() {
            self.render.workspace_root = Some(root.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            auth,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            auth: build_auth_settings(auth),
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings {
        addr,
        read_timeout: positive_duration(
            server.read_timeout,
            DEFAULT_READ_TIMEOUT,
            "server.read_timeout",
        )?,
        read_header_timeout: positive_duration(
            server.read_header_timeout,
            DEFAULT_READ_HEADER_TIMEOUT,
            "server.read_header_timeout",
        )?,
        write_timeout: positive_duration(
            server.write_timeout,
            DEFAULT_WRITE_TIMEOUT,
            "server.write_timeout",
        )?,
        idle_timeout: positive_duration(
            server.idle_timeout,
            DEFAULT_IDLE_TIMEOUT,
            "server.idle_timeout",
        )?,
        graceful_shutdown: positive_duration(
            server.graceful_shutdown,
            DEFAULT_GRACEFUL_SHUTDOWN,
            "server.graceful_shutdown",
        )?,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_auth_settings(auth: RawAuthSettings) -> AuthSettings {
    // An empty key means "no key configured", matching older deployments.
    let api_key = auth.api_key.filter(|key| !key.is_empty());
    AuthSettings { api_key }
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let worker_limit = match render.worker_limit {
        Some(limit) => clamp_worker_limit(limit),
        None => std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
    };

    let max_body_bytes = render
        .max_body_bytes
        .and_then(|bytes| u64::try_from(bytes).ok())
        .and_then(NonZeroU64::new)
        .or(NonZeroU64::new(DEFAULT_MAX_BODY_BYTES))
        .ok_or_else(|| LoadError::invalid("render.max_body_bytes", "must be greater than zero"))?;
    usize::try_from(max_body_bytes.get()).map_err(|_| {
        LoadError::invalid(
            "render.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let command_timeout = positive_duration(
        render.command_timeout,
        DEFAULT_COMMAND_TIMEOUT,
        "render.command_timeout",
    )?;

    let dpi = render.dpi.unwrap_or(DEFAULT_DPI);
    if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
        return Err(LoadError::invalid(
            "render.dpi",
            format!("must be between {MIN_DPI} and {MAX_DPI}, got {dpi}"),
        ));
    }

    Ok(RenderSettings {
        worker_limit,
        max_body_bytes,
        command_timeout,
        allow_shell_escape: render.allow_shell_escape.unwrap_or(false),
        dpi,
        pdflatex_path: tool_path(
            render.pdflatex_path,
            DEFAULT_PDFLATEX_PATH,
            "render.pdflatex_path",
        )?,
        pdfcrop_path: tool_path(
            render.pdfcrop_path,
            DEFAULT_PDFCROP_PATH,
            "render.pdfcrop_path",
        )?,
        pdftoppm_path: tool_path(
            render.pdftoppm_path,
            DEFAULT_PDFTOPPM_PATH,
            "render.pdftoppm_path",
        )?,
        workspace_root: render
            .workspace_root
            .filter(|root| !root.as_os_str().is_empty()),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    read_timeout: Option<String>,
    read_header_timeout: Option<String>,
    write_timeout: Option<String>,
    idle_timeout: Option<String>,
    graceful_shutdown: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    api_key: Option<String>,
}

impl fmt::Debug for RawAuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawAuthSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    worker_limit: Option<i64>,
    max_body_bytes: Option<i64>,
    command_timeout: Option<String>,
    allow_shell_escape: Option<bool>,
    dpi: Option<u32>,
    pdflatex_path: Option<PathBuf>,
    pdfcrop_path: Option<PathBuf>,
    pdftoppm_path: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn clamp_worker_limit(value: i64) -> NonZeroUsize {
    usize::try_from(value)
        .ok()
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::MIN)
}

fn tool_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

fn positive_duration(
    value: Option<String>,
    default: Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    let Some(text) = value else {
        return Ok(default);
    };
    let duration = parse_duration(&text).map_err(|reason| LoadError::invalid(key, reason))?;
    if duration.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(duration)
}

/// Parse `30s`, `1500ms`, `1h30m`, `2.5m` or a bare number of seconds.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("expected a number in `{trimmed}`"));
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, remaining) = tail.split_at(unit_len);

        let unit_nanos: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(format!("missing unit in `{trimmed}`")),
            other => return Err(format!("unknown unit `{other}` in `{trimmed}`")),
        };

        let segment = if number.contains('.') {
            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid number `{number}` in `{trimmed}`"))?;
            Duration::from_nanos((value * unit_nanos as f64).round() as u64)
        } else {
            let value: u64 = number
                .parse()
                .map_err(|_| format!("invalid number `{number}` in `{trimmed}`"))?;
            let nanos = value
                .checked_mul(unit_nanos)
                .ok_or_else(|| format!("duration `{trimmed}` is too large"))?;
            Duration::from_nanos(nanos)
        };

        total = total
            .checked_add(segment)
            .ok_or_else(|| format!("duration `{trimmed}` is too large"))?;
        rest = remaining;
    }

    Ok(total)
}
