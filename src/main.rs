mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use fauna::cache::{Cache, CacheSource};
use fauna::context::{set_default_cache_size, set_default_config};
use fauna::{ApiClient, Context, Credentials, HttpClient, Params};

#[derive(Parser, Debug)]
#[command(name = "fauna")]
#[command(about = "Issue cached requests against the Fauna REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fauna/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Work from the cache only
  #[arg(long)]
  offline: bool,

  /// Treat FAUNA_SECRET as a publisher key and act as this user ref
  #[arg(long, value_name = "USER_REF")]
  as_user: Option<String>,

  /// Trace id sent with every request
  #[arg(long)]
  trace_id: Option<String>,

  /// Log debug output from the client
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a resource, through the cache
  Get(Request),
  /// Create a resource
  Post(Request),
  /// Update a resource
  Put(Request),
  /// Delete a resource
  Delete(Request),
  /// Drop every cached response for the current identity
  CacheClear,
}

#[derive(clap::Args, Debug)]
struct Request {
  /// Resource path, e.g. users/self
  path: String,

  /// Request parameter as key=value; JSON values are sent as JSON
  #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
  params: Vec<(String, serde_json::Value)>,
}

fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected KEY=VALUE, got {}", s))?;
  let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if args.offline {
    config.reachability = fauna::Reachability::Offline;
  }

  let _log_guard = logging::init(config.log_file.as_deref(), args.verbose)?;

  let context = build_context(&config, &args)?;
  Context::set_default_context(context.clone());

  match args.command {
    Command::Get(request) => {
      let result = context.fetch(&request.path, &request.params()).await?;
      if result.source != CacheSource::Network {
        let stored_at = result
          .stored_at
          .map(|t| t.to_rfc3339())
          .unwrap_or_default();
        eprintln!("(from cache: {:?}, stored {})", result.source, stored_at);
      }
      print_json(&result.data)?;
    }
    Command::Post(request) => print_json(&fauna::post(&request.path, &request.params()).await?)?,
    Command::Put(request) => print_json(&fauna::put(&request.path, &request.params()).await?)?,
    Command::Delete(request) => {
      print_json(&fauna::delete(&request.path, &request.params()).await?)?
    }
    Command::CacheClear => {
      context.clear_cache()?;
      eprintln!("Cache cleared");
    }
  }

  Ok(())
}

impl Request {
  fn params(&self) -> Params {
    self.params.iter().cloned().collect()
  }
}

fn build_context(config: &config::Config, args: &Args) -> Result<Context> {
  let secret = config::Config::get_secret()?;
  let credentials = if args.as_user.is_some() {
    Credentials::PublisherKey(secret)
  } else {
    Credentials::Key(secret)
  };

  let http = HttpClient::with_root(credentials, &config.api_root)?;
  http.set_reachability(config.reachability);
  let client: Arc<dyn ApiClient> = match &args.as_user {
    Some(user_ref) => http
      .as_user(user_ref)
      .map_err(|e| eyre!("Cannot act as {}: {}", user_ref, e))?,
    None => Arc::new(http),
  };

  set_default_config(config.context_config());
  set_default_cache_size(config.cache.size);

  let mut builder = Context::builder(client).persistent(config.cache.persistent);
  if !config.cache.enabled {
    builder = builder.cache(Cache::disabled());
  }
  if let Some(trace_id) = &args.trace_id {
    builder = builder.trace_id(trace_id);
  }
  let context = builder.build()?;
  context.set_log_http_traffic(config.log_http);
  Ok(context)
}

fn print_json(response: &fauna::Response) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(response)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_param() {
    assert_eq!(
      parse_param("size=10").unwrap(),
      ("size".to_string(), serde_json::json!(10))
    );
    assert_eq!(
      parse_param("name=Ada").unwrap(),
      ("name".to_string(), serde_json::json!("Ada"))
    );
    assert!(parse_param("novalue").is_err());
  }

  #[test]
  fn test_cli_parses_subcommands() {
    let args = Args::try_parse_from(["fauna", "--offline", "get", "users/self", "-p", "size=2"]).unwrap();
    assert!(args.offline);
    match args.command {
      Command::Get(request) => {
        assert_eq!(request.path, "users/self");
        assert_eq!(request.params().get("size"), Some(&serde_json::json!(2)));
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
