//! Proxyhop - Transparent forward-proxy routing for outbound HTTP/HTTPS calls
//!
//! This crate lets a process route its outbound calls through a forward proxy
//! configured out-of-band, without call sites knowing the proxy exists.
//!
//! # Features
//!
//! - **Startup resolution**: proxy addresses and exclusions are read once, from TOML or the environment
//! - **Exclusions**: hosts matching a `no_proxy` pattern go direct
//! - **Plain HTTP relaying**: insecure calls are rewritten to absolute-form and sent to the proxy
//! - **CONNECT tunneling**: secure calls get a handle immediately; TLS runs over the tunnel once it is up
//!
//! # Example
//!
//! ```no_run
//! use proxyhop::{
//!     Config, OutboundRequest, ProxyAgent, RequestHandleExt, ResponseCallback, Transport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("proxyhop.toml")?.with_env_overrides();
//!     let agent = ProxyAgent::from_config(&config)?;
//!
//!     let request = OutboundRequest::get("https://api.example.com/v1/status")?;
//!     let on_response: ResponseCallback = Box::new(|resp| println!("status: {}", resp.status()));
//!     let mut handle = agent.request(request, Some(on_response))?;
//!     handle.end();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod request;
pub mod transport;

pub use config::{Config, ProxyEndpoint, ProxySettings};
pub use error::{Error, Result};
pub use filter::{ExclusionList, MatchMode};
pub use proxy::{DeferredRequest, ProxyAgent, Route, SessionState};
pub use request::{OutboundRequest, Scheme};
pub use transport::{
    ClientRequest, EventKind, HttpTransport, RequestEvent, RequestHandle, RequestHandleExt,
    ResponseCallback, Transport,
};
