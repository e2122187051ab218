use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use onemonitor::config::{ClientConfig, ConfigError};
use onemonitor::http::error::ApiError;
use onemonitor::http::notify::Notifier;
use onemonitor::router::{RouteError, RouteTable};
use onemonitor::service::{CmdbService, ListParams};
use onemonitor::session::SessionError;
use onemonitor::{Client, ClientError};
use serde_json::{Value, json};

const BUILTIN_ROUTES: &str = include_str!("../../config/routes.yaml");

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "onemonitor", about = "OneMonitor operations platform CLI")]
struct Cli {
    /// Route tree YAML; the built-in tree is used when absent.
    #[arg(long, env = "ONEMONITOR_ROUTES_FILE")]
    routes: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and store the session.
    Login {
        #[arg(long, env = "ONEMONITOR_USERNAME")]
        username: String,
        #[arg(long, env = "ONEMONITOR_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Clear the stored session.
    Logout,
    /// Print the logged-in user, if any.
    Whoami,
    /// Fetch and store the current user's profile.
    Profile,
    /// Navigate to a page path through the route guard.
    Open { path: String },
    Cmdb(CmdbCommand),
}

#[derive(Args, Debug)]
struct CmdbCommand {
    #[command(subcommand)]
    command: CmdbSubcommand,
}

#[derive(Subcommand, Debug)]
enum CmdbSubcommand {
    #[command(subcommand)]
    CiType(CiTypeCommand),
    #[command(subcommand)]
    Attribute(AttributeCommand),
    #[command(subcommand)]
    Ci(CiCommand),
    #[command(subcommand)]
    Relation(RelationCommand),
}

#[derive(Args, Debug, Clone)]
struct ListArgs {
    #[arg(long)]
    skip: Option<u64>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    ci_type_id: Option<i64>,
    /// CI lifecycle status.
    #[arg(long)]
    status: Option<String>,
    /// CI type activity flag.
    #[arg(long)]
    is_active: Option<bool>,
    #[arg(long)]
    source_ci_id: Option<i64>,
    #[arg(long)]
    target_ci_id: Option<i64>,
    #[arg(long)]
    relation_type: Option<String>,
    /// Additional `key=value` query filter; repeatable.
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
}

impl From<ListArgs> for ListParams {
    fn from(args: ListArgs) -> Self {
        Self {
            skip: args.skip,
            limit: args.limit,
            ci_type_id: args.ci_type_id,
            status: args.status,
            is_active: args.is_active,
            source_ci_id: args.source_ci_id,
            target_ci_id: args.target_ci_id,
            relation_type: args.relation_type,
            extra: args.filters,
        }
    }
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[derive(Subcommand, Debug)]
enum CiTypeCommand {
    List(ListArgs),
    Get {
        id: i64,
    },
    Create {
        #[arg(long)]
        data: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum AttributeCommand {
    List(ListArgs),
    Create {
        #[arg(long)]
        data: String,
    },
}

#[derive(Subcommand, Debug)]
enum CiCommand {
    List(ListArgs),
    Get {
        id: i64,
    },
    /// A CI together with its relations.
    Relations {
        id: i64,
    },
    Create {
        #[arg(long)]
        data: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        id: i64,
    },
    Search {
        /// Search term.
        q: String,
        #[command(flatten)]
        list: ListArgs,
    },
}

#[derive(Subcommand, Debug)]
enum RelationCommand {
    List(ListArgs),
    Create {
        #[arg(long)]
        data: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        id: i64,
    },
}

/// User-visible failure notices go to stderr; payloads go to stdout.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

impl CliError {
    /// API failures have already been printed by the notifier.
    fn already_reported(&self) -> bool {
        matches!(
            self,
            Self::Api(_) | Self::Client(ClientError::Api(_) | ClientError::Session(SessionError::Api(_)))
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.already_reported() {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = ClientConfig::from_env()?;
    let routes = match &cli.routes {
        Some(path) => RouteTable::from_yaml_file(path)?,
        None => RouteTable::from_yaml_str(BUILTIN_ROUTES)?,
    };
    let client = Client::from_config(&config, routes, Arc::new(StderrNotifier))?;

    match cli.command {
        Command::Login { username, password } => {
            let payload = client.login(&username, &password).await?;
            print_json(&payload)
        }
        Command::Logout => {
            client.logout();
            println!("logged out");
            Ok(())
        }
        Command::Whoami => {
            if client.session().is_logged_in() {
                println!("{}", client.session().username());
            } else {
                println!("not logged in");
            }
            Ok(())
        }
        Command::Profile => {
            let profile = client.fetch_profile().await?;
            print_json(&serde_json::to_value(profile)?)
        }
        Command::Open { path } => run_open(&client, &path),
        Command::Cmdb(cmdb) => {
            let payload = run_cmdb(client.cmdb(), cmdb.command).await?;
            print_json(&payload)
        }
    }
}

fn run_open(client: &Client, path: &str) -> Result<(), CliError> {
    let location = client.navigator().push(path)?;
    print_json(&json!({
        "path": location.path,
        "name": location.name,
        "params": location.params,
        "redirectedFrom": location.redirected_from,
        "title": client.title().current(),
    }))
}

async fn run_cmdb(cmdb: &CmdbService, command: CmdbSubcommand) -> Result<Value, CliError> {
    let payload = match command {
        CmdbSubcommand::CiType(command) => match command {
            CiTypeCommand::List(args) => cmdb.list_ci_types(&args.into()).await?,
            CiTypeCommand::Get { id } => cmdb.get_ci_type(id).await?,
            CiTypeCommand::Create { data } => cmdb.create_ci_type(&parse_data(&data)?).await?,
            CiTypeCommand::Update { id, data } => cmdb.update_ci_type(id, &parse_data(&data)?).await?,
            CiTypeCommand::Delete { id } => cmdb.delete_ci_type(id).await?,
        },
        CmdbSubcommand::Attribute(command) => match command {
            AttributeCommand::List(args) => cmdb.list_ci_attributes(&args.into()).await?,
            AttributeCommand::Create { data } => cmdb.create_ci_attribute(&parse_data(&data)?).await?,
        },
        CmdbSubcommand::Ci(command) => match command {
            CiCommand::List(args) => cmdb.list_cis(&args.into()).await?,
            CiCommand::Get { id } => cmdb.get_ci(id).await?,
            CiCommand::Relations { id } => cmdb.get_ci_with_relations(id).await?,
            CiCommand::Create { data } => cmdb.create_ci(&parse_data(&data)?).await?,
            CiCommand::Update { id, data } => cmdb.update_ci(id, &parse_data(&data)?).await?,
            CiCommand::Delete { id } => cmdb.delete_ci(id).await?,
            CiCommand::Search { q, list } => cmdb.search_cis(&q, &list.into()).await?,
        },
        CmdbSubcommand::Relation(command) => match command {
            RelationCommand::List(args) => cmdb.list_relations(&args.into()).await?,
            RelationCommand::Create { data } => cmdb.create_relation(&parse_data(&data)?).await?,
            RelationCommand::Update { id, data } => cmdb.update_relation(id, &parse_data(&data)?).await?,
            RelationCommand::Delete { id } => cmdb.delete_relation(id).await?,
        },
    };
    Ok(payload)
}

fn parse_data(data: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str(data)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cmdb_search() {
        let cli = Cli::try_parse_from(["onemonitor", "cmdb", "ci", "search", "db", "--ci-type-id", "3"]).unwrap();
        let Command::Cmdb(CmdbCommand { command: CmdbSubcommand::Ci(CiCommand::Search { q, list }) }) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(q, "db");
        assert_eq!(ListParams::from(list).ci_type_id, Some(3));
    }

    #[test]
    fn search_requires_term() {
        assert!(Cli::try_parse_from(["onemonitor", "cmdb", "ci", "search"]).is_err());
    }

    #[test]
    fn parses_relation_filters() {
        let cli = Cli::try_parse_from([
            "onemonitor", "cmdb", "relation", "list", "--source-ci-id", "7", "--filter", "owner=ops",
        ])
        .unwrap();
        let Command::Cmdb(CmdbCommand { command: CmdbSubcommand::Relation(RelationCommand::List(args)) }) = cli.command
        else {
            panic!("unexpected command");
        };
        let params = ListParams::from(args);
        assert_eq!(params.source_ci_id, Some(7));
        assert_eq!(params.extra, vec![("owner".to_owned(), "ops".to_owned())]);
    }

    #[test]
    fn filter_without_equals_is_rejected() {
        assert!(parse_filter("owner").is_err());
        assert!(parse_filter("=x").is_err());
        assert_eq!(parse_filter("a=b=c").unwrap(), ("a".to_owned(), "b=c".to_owned()));
    }

    #[test]
    fn api_failures_are_not_reported_twice() {
        let api = onemonitor::http::error::classify(onemonitor::http::error::TransportError::Network("down".into()));
        assert!(CliError::Api(api.clone()).already_reported());
        assert!(CliError::Client(ClientError::Session(SessionError::Api(api))).already_reported());
        assert!(!CliError::Client(ClientError::Session(SessionError::MissingToken)).already_reported());
        assert!(!parse_data("{").unwrap_err().already_reported());
    }

    #[test]
    fn parses_open_path() {
        let cli = Cli::try_parse_from(["onemonitor", "open", "/alert/rule"]).unwrap();
        assert!(matches!(cli.command, Command::Open { ref path } if path == "/alert/rule"));
    }

    #[test]
    fn builtin_routes_parse() {
        let routes = RouteTable::from_yaml_str(BUILTIN_ROUTES).unwrap();
        assert!(routes.resolve_named("Login").is_ok());
    }

    #[test]
    fn rejects_bad_json_data() {
        assert!(matches!(parse_data("{not json"), Err(CliError::InvalidJson(_))));
    }
}
