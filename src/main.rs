//! Proxyhop CLI - issue outbound calls through the configured forward proxy

use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use proxyhop::{
    Config, EventKind, OutboundRequest, ProxyAgent, ProxySettings, RequestEvent,
    RequestHandleExt, ResponseCallback, Route, Scheme, Transport,
};

#[derive(Parser)]
#[command(name = "proxyhop")]
#[command(about = "Transparent forward-proxy routing for outbound HTTP/HTTPS calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a request through the configured proxy
    Fetch {
        /// Absolute http:// or https:// URL
        url: String,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header, as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Print the status line and response headers
        #[arg(short, long)]
        include: bool,

        /// Give up when no response arrives within this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Path to configuration file (defaults to the environment)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace; overrides config)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show how calls to a host would be routed
    CheckHost {
        /// Destination host name or address
        host: String,

        /// Path to configuration file (defaults to the environment)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// How a fetch ended
enum Outcome {
    Response(Response<Incoming>),
    Failed(String),
}

fn load_config(path: Option<&Path>) -> proxyhop::Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?.with_env_overrides()),
        None => Ok(Config::from_env()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), Box<dyn std::error::Error>> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("Invalid header '{}': expected 'Name: value'", raw))?;
    Ok((
        HeaderName::from_bytes(name.trim().as_bytes())?,
        HeaderValue::from_str(value.trim())?,
    ))
}

fn describe_endpoint(settings: &ProxySettings, scheme: Scheme) -> (String, bool) {
    match settings.endpoint(scheme) {
        Ok(Some(endpoint)) => (endpoint.to_string(), true),
        Ok(None) => ("(not set)".to_string(), true),
        Err(e) => (format!("invalid ({})", e), false),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            url,
            method,
            data,
            headers,
            include,
            timeout,
            config,
            log_level,
        } => {
            let cfg = load_config(config.as_deref())?;
            init_logging(log_level.as_deref().unwrap_or(&cfg.logging.level));

            let agent =
                ProxyAgent::from_config(&cfg)?.with_decision_logging(cfg.logging.log_decisions);

            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
            let mut request = OutboundRequest::from_url(method, &url)?;
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request.headers.append(name, value);
            }
            let body = data.map(Bytes::from);
            if let Some(ref body) = body {
                request.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            let on_response: ResponseCallback = {
                let tx = tx.clone();
                Box::new(move |resp| {
                    let _ = tx.send(Outcome::Response(resp));
                })
            };

            let mut handle = agent.request(request, Some(on_response))?;
            let errors = tx.clone();
            handle.on(EventKind::Error, move |event| {
                if let RequestEvent::Error(e) = event {
                    let _ = errors.send(Outcome::Failed(e.to_string()));
                }
            });
            let timeouts = tx.clone();
            handle.on(EventKind::Timeout, move |_| {
                let _ = timeouts.send(Outcome::Failed("Timed out waiting for response".into()));
            });
            if let Some(secs) = timeout {
                handle.set_timeout(Duration::from_secs(secs));
            }
            if let Some(body) = body {
                handle.write(body);
            }
            handle.end();
            drop(tx);

            let resp = match rx.recv().await {
                Some(Outcome::Response(resp)) => resp,
                Some(Outcome::Failed(message)) => {
                    handle.abort();
                    return Err(message.into());
                }
                None => return Err("Request ended without a response".into()),
            };

            if include {
                println!("{:?} {}", resp.version(), resp.status());
                for (name, value) in resp.headers() {
                    println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
                }
                println!();
            }
            let body = resp.into_body().collect().await?.to_bytes();
            print!("{}", String::from_utf8_lossy(&body));
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;
            let settings = ProxySettings::from_config(&cfg);

            let (http, http_ok) = describe_endpoint(&settings, Scheme::Http);
            let (https, https_ok) = describe_endpoint(&settings, Scheme::Https);

            println!();
            println!("  HTTP proxy: {}", http);
            println!("  HTTPS proxy: {}", https);
            println!(
                "  TLS CA bundle: {}",
                cfg.proxy.tls_ca.as_deref().unwrap_or("(not set)")
            );
            println!("  Log level: {}", cfg.logging.level);
            println!("  Log decisions: {}", cfg.logging.log_decisions);

            let exclusions = settings.exclusions();
            println!(
                "  Exclusions: {} ({:?} match)",
                exclusions.patterns().len(),
                exclusions.mode()
            );
            for (i, pattern) in exclusions.patterns().iter().enumerate() {
                println!("    {}. {}", i + 1, pattern);
            }

            // Catch an unreadable CA bundle now rather than on the first call
            ProxyAgent::from_config(&cfg)?;

            if !(http_ok && https_ok) {
                return Err("Configuration has invalid proxy addresses".into());
            }
            println!();
            println!("Configuration is valid!");
        }

        Commands::CheckHost { host, config } => {
            let cfg = load_config(config.as_deref())?;
            let settings = ProxySettings::from_config(&cfg);
            let agent = ProxyAgent::new(settings, Default::default());

            println!("{}", host);
            for scheme in [Scheme::Http, Scheme::Https] {
                let settings = agent.settings();
                let detail = match agent.route(scheme, &host) {
                    Route::Proxied => match settings.endpoint(scheme) {
                        Ok(Some(endpoint)) => format!("via {}", endpoint),
                        Ok(None) => String::new(),
                        Err(e) => format!("via invalid proxy ({})", e),
                    },
                    Route::Direct if !settings.is_enabled(scheme) => {
                        "no proxy configured".to_string()
                    }
                    Route::Direct => match settings.exclusions().matching_pattern(&host) {
                        Some(pattern) => format!("excluded by '{}'", pattern),
                        None => String::new(),
                    },
                };
                let line = format!("  {}: {} {}", scheme, agent.route(scheme, &host), detail);
                println!("{}", line.trim_end());
            }
        }
    }

    Ok(())
}
