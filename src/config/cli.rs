use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the texshot binary.
#[derive(Debug, Parser)]
#[command(name = "texshot", version, about = "LaTeX to PNG render service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TEXSHOT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the render HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

/// Overrides for the render pipeline. The flat environment variables are the
/// ones older deployments of the service already export.
#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Maximum number of renders running at once.
    #[arg(long = "worker-limit", env = "WORKER_LIMIT", value_name = "COUNT")]
    pub worker_limit: Option<i64>,

    /// Maximum accepted request body in bytes.
    #[arg(long = "max-body-bytes", env = "MAX_BODY_BYTES", value_name = "BYTES")]
    pub max_body_bytes: Option<i64>,

    /// Deadline shared by all stages of one render (e.g. `30s`).
    #[arg(long = "command-timeout", env = "COMMAND_TIMEOUT", value_name = "DURATION")]
    pub command_timeout: Option<String>,

    /// Allow pdflatex to run `\write18` shell commands.
    #[arg(
        long = "allow-shell-escape",
        env = "ALLOW_SHELL_ESCAPE",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub allow_shell_escape: Option<bool>,

    /// Rasterisation resolution in dots per inch.
    #[arg(long = "render-dpi", value_name = "DPI")]
    pub dpi: Option<u32>,

    /// Override the pdflatex executable.
    #[arg(long = "pdflatex-path", value_name = "PATH")]
    pub pdflatex_path: Option<PathBuf>,

    /// Override the pdfcrop executable.
    #[arg(long = "pdfcrop-path", value_name = "PATH")]
    pub pdfcrop_path: Option<PathBuf>,

    /// Override the pdftoppm executable.
    #[arg(long = "pdftoppm-path", value_name = "PATH")]
    pub pdftoppm_path: Option<PathBuf>,

    /// Directory under which per-render workspaces are created.
    #[arg(long = "workspace-root", value_name = "PATH")]
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", env = "PORT", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Time allowed to read a whole request body.
    #[arg(long = "server-read-timeout", env = "READ_TIMEOUT", value_name = "DURATION")]
    pub read_timeout: Option<String>,

    /// Time allowed to read request headers.
    #[arg(
        long = "server-read-header-timeout",
        env = "READ_HEADER_TIMEOUT",
        value_name = "DURATION"
    )]
    pub read_header_timeout: Option<String>,

    /// Time allowed to produce a response.
    #[arg(long = "server-write-timeout", env = "WRITE_TIMEOUT", value_name = "DURATION")]
    pub write_timeout: Option<String>,

    /// Time an idle keep-alive connection is kept open.
    #[arg(long = "server-idle-timeout", env = "IDLE_TIMEOUT", value_name = "DURATION")]
    pub idle_timeout: Option<String>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown", value_name = "DURATION")]
    pub graceful_shutdown: Option<String>,

    /// Shared secret clients must present; unset disables authorization.
    #[arg(
        long = "api-key",
        env = "LATEX_SERVICE_API_KEY",
        value_name = "KEY",
        hide_env_values = true
    )]
    pub api_key: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
