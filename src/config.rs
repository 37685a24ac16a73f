use crate::upstream::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL, UpstreamConfig};
use clap::Args;
use std::path::PathBuf;
use uuid::Uuid;

pub const UPSTREAM_API_KEY_ENV: &str = "COACH_UPSTREAM_API_KEY";

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "COACH_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: String,

    /// Completion endpoint the relay forwards to
    #[arg(long, env = "COACH_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,

    #[arg(long, env = "COACH_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Bearer token callers must present (generated and saved if omitted)
    #[arg(long, env = "COACH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Base URL of the relay
    #[arg(long, env = "COACH_URL", default_value = "http://127.0.0.1:8787")]
    pub url: String,

    #[arg(long, env = "COACH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Send one message, print the streamed reply and exit
    #[arg(long)]
    pub prompt: Option<String>,
}

impl ServeArgs {
    /// The upstream credential only ever comes from the environment.
    pub fn upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.upstream_url.clone(),
            model: self.model.clone(),
            api_key: std::env::var(UPSTREAM_API_KEY_ENV).ok(),
        }
    }
}

/// Returns the relay's caller token: the explicit one (persisted for local
/// clients), the saved one, or a freshly generated one.
pub fn resolve_server_token(explicit: Option<String>) -> anyhow::Result<String> {
    if let Some(token) = explicit {
        write_token_file(&token)?;
        return Ok(token);
    }

    if let Some(token) = read_token_file() {
        return Ok(token);
    }

    let token = Uuid::new_v4().to_string();
    write_token_file(&token)?;
    Ok(token)
}

pub fn resolve_client_token(explicit: Option<String>) -> Option<String> {
    explicit
        .filter(|token| !token.trim().is_empty())
        .or_else(read_token_file)
}

fn read_token_file() -> Option<String> {
    let token = std::fs::read_to_string(token_path()).ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn write_token_file(token: &str) -> anyhow::Result<()> {
    let path = token_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path)?;
    use std::io::Write;
    file.write_all(token.as_bytes())?;
    Ok(())
}

pub fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".coach").join("relay.token");
    }

    PathBuf::from("coach.token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn serve_defaults_point_at_the_gateway() {
        let cli = TestCli::try_parse_from(["coach", "--listen", "0.0.0.0:9000"]).unwrap();
        assert_eq!(cli.serve.listen, "0.0.0.0:9000");
        assert_eq!(cli.serve.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cli.serve.model, DEFAULT_MODEL);
    }

    #[test]
    fn explicit_client_token_wins() {
        assert_eq!(
            resolve_client_token(Some("abc".to_string())).as_deref(),
            Some("abc")
        );
    }
}
