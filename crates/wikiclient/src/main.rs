use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use wikiclient_core::config::load_config;
use wikiclient_core::pages::PageTreeNode;
use wikiclient_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    normalize_for_display, resolve_paths,
};
use wikiclient_core::session::{FileSecretStore, SessionStore};
use wikiclient_core::{RpcValue, TransportConfig, WikiService, XmlRpcClient, XmlRpcTransport};

#[derive(Debug, Parser)]
#[command(
    name = "wikiclient",
    version,
    about = "Command-line client for DokuWiki-style XML-RPC wikis"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    state_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            state_dir: cli.state_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the state directory and default config")]
    Init(InitArgs),
    Login(LoginArgs),
    Logout,
    #[command(about = "Show the stored session user")]
    Whoami,
    #[command(about = "Print raw page markup")]
    Get(GetArgs),
    #[command(about = "Print rendered page HTML")]
    Html(PageArgs),
    Info(PageArgs),
    #[command(about = "Save page content from a file or stdin")]
    Put(PutArgs),
    List(ListArgs),
    Namespaces(NamespacesArgs),
    Search(SearchArgs),
    Recent(RecentArgs),
    #[command(about = "Invoke a raw XML-RPC method with JSON parameters")]
    Call(CallArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Wiki base URL or XML-RPC endpoint to record in config")]
    url: Option<String>,
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct LoginArgs {
    username: String,
    #[arg(long, env = "WIKI_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    id: String,
}

#[derive(Debug, Args)]
struct GetArgs {
    id: String,
    #[arg(long, help = "Print markup, HTML and modification stamp as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct PutArgs {
    id: String,
    #[arg(long, value_name = "PATH", help = "Read content from file instead of stdin")]
    file: Option<PathBuf>,
    #[arg(short = 's', long, default_value = "")]
    summary: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(default_value = ".")]
    namespace: String,
    #[arg(long, help = "Print pages as a namespace tree")]
    tree: bool,
}

#[derive(Debug, Args)]
struct NamespacesArgs {
    #[arg(long, help = "Only namespaces the logged-in user may browse")]
    allowed: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RecentArgs {
    #[arg(long, default_value_t = 0, help = "Unix timestamp lower bound")]
    since: i64,
}

#[derive(Debug, Args)]
struct CallArgs {
    method: String,
    #[arg(help = "Parameters as JSON values; anything that is not valid JSON is sent as a string")]
    params: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Login(args)) => run_login(&runtime, args).await,
        Some(Commands::Logout) => run_logout(&runtime).await,
        Some(Commands::Whoami) => run_whoami(&runtime),
        Some(Commands::Get(args)) => run_get(&runtime, args).await,
        Some(Commands::Html(PageArgs { id })) => {
            let wiki = open_wiki(&runtime)?;
            println!("{}", wiki.get_page_html(&id).await);
            Ok(())
        }
        Some(Commands::Info(PageArgs { id })) => {
            let wiki = open_wiki(&runtime)?;
            print_json(&wiki.get_page_info(&id).await?)
        }
        Some(Commands::Put(args)) => run_put(&runtime, args).await,
        Some(Commands::List(args)) => run_list(&runtime, args).await,
        Some(Commands::Namespaces(args)) => run_namespaces(&runtime, args).await,
        Some(Commands::Search(args)) => run_search(&runtime, args).await,
        Some(Commands::Recent(RecentArgs { since })) => {
            let wiki = open_wiki(&runtime)?;
            print_json(&wiki.get_recent_changes(since).await?)
        }
        Some(Commands::Call(args)) => run_call(&runtime, args).await,
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            url: args.url,
            force: args.force,
        },
    )?;

    println!("Initialized wikiclient state");
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_state_dir: {}", format_flag(report.created_state_dir));
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("recorded_url: {}", format_flag(report.patched_url));
    print_diagnostics(runtime, &paths);
    Ok(())
}

async fn run_login(runtime: &RuntimeOptions, args: LoginArgs) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    if !wiki.login(&args.username, &args.password).await {
        bail!("login failed for {}", args.username);
    }
    println!("logged in as {}", args.username);
    Ok(())
}

async fn run_logout(runtime: &RuntimeOptions) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    wiki.logout().await;
    println!("logged out");
    Ok(())
}

fn run_whoami(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let session = file_session(&paths);
    match (session.is_authenticated()?, session.username()?) {
        (true, Some(username)) => println!("user: {username}"),
        _ => println!("user: <anonymous>"),
    }
    println!(
        "session_cookie: {}",
        if session.cookie()?.is_some() {
            "present"
        } else {
            "absent"
        }
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

async fn run_get(runtime: &RuntimeOptions, args: GetArgs) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    if args.json {
        return print_json(&wiki.get_page_content(&args.id).await?);
    }
    println!("{}", wiki.get_page(&args.id).await?);
    Ok(())
}

async fn run_put(runtime: &RuntimeOptions, args: PutArgs) -> Result<()> {
    let content = match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read page content from stdin")?;
            buffer
        }
    };

    let wiki = open_wiki(runtime)?;
    if !wiki.put_page(&args.id, &content, &args.summary).await? {
        bail!("server refused to save {}", args.id);
    }
    println!("saved: {}", args.id);
    Ok(())
}

async fn run_list(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    if args.tree {
        let tree = wiki.page_tree(&args.namespace).await?;
        print_tree(&tree, 0);
        return Ok(());
    }

    let pages = wiki.list_pages(&args.namespace).await?;
    println!("pages.count: {}", pages.len());
    for page in pages {
        println!("{}", page.id);
    }
    Ok(())
}

fn print_tree(node: &PageTreeNode, depth: usize) {
    for (segment, child) in &node.children {
        let marker = if child.children.is_empty() { "" } else { "/" };
        println!("{}{segment}{marker}", "  ".repeat(depth));
        print_tree(child, depth + 1);
    }
}

async fn run_namespaces(runtime: &RuntimeOptions, args: NamespacesArgs) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    let namespaces: Vec<String> = if args.allowed {
        wiki.browsable_namespaces().await?
    } else {
        wiki.list_namespaces().await?.into_iter().collect()
    };
    if namespaces.is_empty() {
        println!("namespaces: <none>");
    }
    for namespace in namespaces {
        println!("{namespace}");
    }
    Ok(())
}

async fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let wiki = open_wiki(runtime)?;
    let hits = wiki.search(&args.query).await;
    if args.json {
        return print_json(&hits);
    }

    println!("results.count: {}", hits.len());
    for hit in hits {
        match hit.snippet {
            Some(snippet) => println!("{} ({:?}): {snippet}", hit.id, hit.match_type),
            None => println!("{} ({:?})", hit.id, hit.match_type),
        }
    }
    Ok(())
}

async fn run_call(runtime: &RuntimeOptions, args: CallArgs) -> Result<()> {
    let params = args
        .params
        .iter()
        .map(|raw| parse_param(raw))
        .collect::<Result<Vec<_>>>()?;
    let wiki = open_wiki(runtime)?;
    match wiki.transport().call(&args.method, &params).await? {
        Some(value) => print_json(&value.to_json()),
        None => {
            println!("<empty>");
            Ok(())
        }
    }
}

fn parse_param(raw: &str) -> Result<RpcValue> {
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(_) => return Ok(RpcValue::from(raw)),
    };
    RpcValue::try_from(value).with_context(|| format!("unsupported parameter: {raw}"))
}

fn open_wiki(runtime: &RuntimeOptions) -> Result<WikiService<XmlRpcClient>> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let transport_config = TransportConfig::from_config(&config)?;
    print_diagnostics(runtime, &paths);

    let client = XmlRpcClient::new(transport_config, file_session(&paths))?;
    debug!(endpoint = client.endpoint(), "opening wiki client");
    Ok(WikiService::new(client, &config))
}

fn file_session(paths: &ResolvedPaths) -> SessionStore {
    SessionStore::new(Arc::new(FileSecretStore::new(paths.session_path.clone())))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        state_dir: runtime.state_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let state_env = initial.state_dir.join(".env");
    if state_env.exists() {
        let _ = dotenvy::from_path_override(&state_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use wikiclient_core::RpcValue;

    use super::{Cli, parse_param};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn call_params_accept_json_and_bare_strings() {
        assert_eq!(parse_param("42").expect("int"), RpcValue::Integer(42));
        assert_eq!(
            parse_param("wiki:start").expect("bare"),
            RpcValue::from("wiki:start")
        );
        assert_eq!(
            parse_param(r#"{"sum":"x"}"#).expect("struct"),
            RpcValue::from_members([("sum", RpcValue::from("x"))])
        );
        assert!(parse_param("null").is_err());
    }
}
