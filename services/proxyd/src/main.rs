use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use proxyd::{HttpFetcher, Messenger, NodeInfo, ProxyNode};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("proxyd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A node of the distributed caching forward-proxy cluster")
        .arg(
            Arg::new("host")
                .help("Address the peer listener binds to. Eg. 192.168.0.12")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .help("Port the peer listener binds to")
                .value_parser(clap::value_parser!(u16))
                .required(true),
        )
        .arg(
            Arg::new("leader")
                .help("Start as the cluster leader and bind the public endpoint")
                .short('l')
                .long("leader")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("join")
                .help("host:port of an existing cluster member to join through")
                .short('j')
                .long("join")
                .required_unless_present("leader"),
        )
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .default_value("proxyd.toml"),
        )
        .get_matches();

    let host = matches.get_one::<String>("host").expect("host is required");
    let port = *matches.get_one::<u16>("port").expect("port is required");
    let is_leader = matches.get_flag("leader");
    let join_url = matches.get_one::<String>("join").cloned();
    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");

    let config = match proxyd::config::load_config_from_path(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let info = NodeInfo::new(host, port);
    let messenger = match Messenger::bind(&info.url).await {
        Ok(messenger) => messenger,
        Err(e) => {
            eprintln!("FATAL: cannot bind peer listener on {}: {e}", info.url);
            std::process::exit(1);
        }
    };

    let fetch_timeout = config.fetch_timeout_secs.map(Duration::from_secs);
    let fetcher = match HttpFetcher::new(fetch_timeout) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            eprintln!("FATAL: cannot build the upstream client: {e}");
            std::process::exit(1);
        }
    };

    let node = ProxyNode::new(info, config, messenger, Arc::new(fetcher), is_leader);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %node.url(),
        id = node.id(),
        leader = is_leader,
        "node starting"
    );

    if is_leader {
        if let Err(e) = proxyd::http::ensure_public_endpoint(&node).await {
            eprintln!(
                "FATAL: cannot bind public endpoint on {}: {e}",
                node.config().public_url
            );
            std::process::exit(1);
        }
    }

    node.start();

    if let Some(join_url) = join_url {
        if let Err(e) = node.join_cluster(&join_url).await {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: cannot listen for shutdown signal: {e}");
        std::process::exit(1);
    }
    info!("shutting down");
}
