use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{ArgAction, Parser};
use ladder_proxy::{
    DomainMatch, Ladder, LadderConfig, RewriteMode, RuleSet, ServerConfig,
    config::{DEFAULT_FORWARDED_FOR, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT, parse_domain_list},
    spawn_proxy,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ladder", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    /// Port for the HTTP server
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,
    /// `;`-separated rule files or directories of `*.yml`/`*.yaml` files
    #[arg(long, default_value = "", env = "RULESET")]
    ruleset: String,
    /// Comma-separated hosts the proxy may fetch from; empty allows all
    #[arg(long, default_value = "", env = "ALLOWED_DOMAINS")]
    allowed_domains: String,
    /// Also allow every domain named in the ruleset
    #[arg(long, env = "ALLOWED_DOMAINS_RULESET")]
    allowed_domains_ruleset: bool,
    /// How allow-list entries match a host: prefix or label-suffix
    #[arg(long, default_value_t = DomainMatch::Prefix, env = "DOMAIN_MATCH")]
    domain_match: DomainMatch,
    /// Outbound request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "HTTP_TIMEOUT")]
    http_timeout: u64,
    #[arg(long, default_value = DEFAULT_USER_AGENT, env = "USER_AGENT")]
    user_agent: String,
    #[arg(long, default_value = DEFAULT_FORWARDED_FOR, env = "X_FORWARDED_FOR")]
    x_forwarded_for: String,
    /// Log every resolved target URL
    #[arg(long, env = "LOG_URLS")]
    log_urls: bool,
    /// Serve the active ruleset at /ruleset
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "EXPOSE_RULESET")]
    expose_ruleset: bool,
    /// Link rewriting for img/script sources: literal or tag-regex
    #[arg(long, default_value_t = RewriteMode::Literal, env = "REWRITE_MODE")]
    rewrite_mode: RewriteMode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing();

    let rules = RuleSet::load(&options.ruleset).context("refusing to start with a broken ruleset")?;
    let config = LadderConfig {
        user_agent: options.user_agent,
        forwarded_for: options.x_forwarded_for,
        timeout: Duration::from_secs(options.http_timeout),
        allowed_domains: parse_domain_list(&options.allowed_domains),
        allowed_domains_ruleset: options.allowed_domains_ruleset,
        domain_match: options.domain_match,
        log_urls: options.log_urls,
        expose_ruleset: options.expose_ruleset,
        rewrite_mode: options.rewrite_mode,
    };
    info!(
        timeout_secs = options.http_timeout,
        rewrite_mode = %config.rewrite_mode,
        expose_ruleset = config.expose_ruleset,
        "starting ladder"
    );

    let ladder = Arc::new(Ladder::new(config, rules));
    let server = ServerConfig {
        bind_addr: SocketAddr::new(options.bind, options.port),
    };
    let handle = spawn_proxy(server, ladder).await?;

    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    info!("shutdown signal received");
}
