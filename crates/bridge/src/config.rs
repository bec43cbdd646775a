//! Command line and environment configuration.

use clap::{Args, Parser, Subcommand, ValueEnum};
use oamcp_http_tools::oauth::AuthConfig;
use oamcp_openapi_tools::document::LoadOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "oamcp-bridge", version, about = "Expose OpenAPI operations as MCP tools")]
pub struct Cli {
    #[command(flatten)]
    pub config: BridgeConfig,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the MCP HTTP endpoints (default).
    Serve,
    /// Print the extracted tools and exit.
    List,
    /// Write the tool catalog as JSON and exit.
    Export {
        /// Destination file; `-` writes to stdout.
        #[arg(long, short = 'o', default_value = "tools.json")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct BridgeConfig {
    /// `OpenAPI` document (file path or http(s) URL). Repeat for several documents.
    #[arg(
        long = "spec",
        env = "OAMCP_SPECS",
        value_delimiter = ',',
        global = true
    )]
    pub specs: Vec<String>,

    /// Override the backend base URL declared by the documents' `servers`.
    #[arg(long, env = "OAMCP_BASE_URL", global = true)]
    pub base_url: Option<String>,

    #[arg(long, env = "OAMCP_BIND", default_value = "127.0.0.1:8000", global = true)]
    pub bind: SocketAddr,

    #[arg(long, env = "OAMCP_REQUEST_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub request_timeout_secs: u64,

    /// Refresh tokens this many seconds before they expire.
    #[arg(long, env = "OAMCP_TOKEN_MARGIN_SECS", default_value_t = 30, global = true)]
    pub token_margin_secs: u64,

    /// Reject backend responses (and fetched documents) larger than this.
    #[arg(long, env = "OAMCP_MAX_RESPONSE_BYTES", global = true)]
    pub max_response_bytes: Option<usize>,

    /// Events buffered per SSE subscriber before the oldest are dropped.
    #[arg(long, env = "OAMCP_SSE_BUFFER", default_value_t = 64, global = true)]
    pub sse_buffer: usize,

    #[arg(long, env = "OAMCP_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, env = "OAMCP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub auth: AuthArgs,
}

/// OAuth2 client credentials. Auth is enabled only when all three mandatory values are set.
#[derive(Debug, Clone, Default, Args)]
pub struct AuthArgs {
    #[arg(long, env = "API_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    #[arg(long, env = "API_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub client_secret: Option<String>,

    #[arg(long, env = "API_TOKEN_URL", global = true)]
    pub token_url: Option<String>,

    #[arg(long, env = "API_SCOPE", global = true)]
    pub scope: Option<String>,
}

impl AuthArgs {
    /// Whether any credential value was supplied at all.
    #[must_use]
    pub fn any_set(&self) -> bool {
        [&self.client_id, &self.client_secret, &self.token_url]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

impl BridgeConfig {
    /// Checks clap cannot express for global arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if no document was given.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.specs.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("at least one --spec (or OAMCP_SPECS) is required");
        }
        Ok(())
    }

    #[must_use]
    pub fn auth_config(&self) -> Option<AuthConfig> {
        AuthConfig::from_parts(
            self.auth.client_id.clone(),
            self.auth.client_secret.clone(),
            self.auth.token_url.clone(),
            self.auth.scope.clone(),
        )
    }

    #[must_use]
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            base_url_override: self.base_url.clone(),
            max_spec_bytes: self.max_response_bytes,
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn token_margin(&self) -> Duration {
        Duration::from_secs(self.token_margin_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("oamcp-bridge").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn defaults_apply() {
        let cli = parse(&["--spec", "api.yaml"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config.specs, ["api.yaml"]);
        assert_eq!(cli.config.bind.to_string(), "127.0.0.1:8000");
        assert_eq!(cli.config.request_timeout(), Duration::from_secs(30));
        assert_eq!(cli.config.token_margin(), Duration::from_secs(30));
        assert_eq!(cli.config.sse_buffer, 64);
        assert_eq!(cli.config.log_format, LogFormat::Text);
    }

    #[test]
    fn specs_repeat_and_split_on_commas() {
        let cli = parse(&["--spec", "a.yaml,b.yaml", "--spec", "https://x.test/openapi.json"]);
        assert_eq!(cli.config.specs, ["a.yaml", "b.yaml", "https://x.test/openapi.json"]);
    }

    #[test]
    fn subcommands_accept_global_flags_after_them() {
        let cli = parse(&["export", "--output", "out.json", "--spec", "api.yaml"]);
        match cli.command {
            Some(Command::Export { output }) => assert_eq!(output, PathBuf::from("out.json")),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config.specs, ["api.yaml"]);
    }

    #[test]
    fn spec_is_required() {
        let mut cli = parse(&["--spec", "api.yaml", "list"]);
        assert!(cli.config.validate().is_ok());
        cli.config.specs.clear();
        assert!(cli.config.validate().is_err());
    }

    #[test]
    fn auth_needs_all_three_values() {
        let mut cli = parse(&[
            "--spec",
            "api.yaml",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
        ]);
        assert!(cli.config.auth.any_set());
        assert!(cli.config.auth_config().is_none());

        cli.config.auth.token_url = Some("https://auth.test/token".to_string());
        let auth = cli.config.auth_config().expect("complete credentials");
        assert_eq!(auth.token_url, "https://auth.test/token");
    }
}
