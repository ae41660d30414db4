use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use echoes::{
    AccessLog, CertificateStore, FileAccessLog, GatewayService, HttpClient, HttpClientAdapter,
    HttpHandler, HttpsRedirect, Pipeline,
    config::{GatewayConfig, GatewayConfigValidator, load_config, load_config_unchecked},
    metrics,
    tracing_setup::{self, LogFormat},
    utils::{GracefulShutdown, ShutdownReason},
};
use futures_util::StreamExt;
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "resources/echoes.yaml";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Process log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("TLS accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error reporter: {e}");
    }

    let args = Args::parse();
    if let Err(e) = tracing_setup::init(args.log_format) {
        eprintln!("Failed to initialize logging: {e:?}");
        std::process::exit(1);
    }

    let result = match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config),
        Some(Commands::Serve { config }) => serve(&config),
        None => serve(&args.config),
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("echoes-worker");
    if config.worker > 0 {
        builder.worker_threads(config.worker);
    }
    let runtime = builder.build().context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::debug!("Crypto provider already installed: {:?}", e);
    }
    metrics::init_metrics();

    let config = Arc::new(config);

    // Every certificate must load before any listener is bound
    let tls_config = if config.tls_enabled() {
        let domains = config.tls_domains();
        let store = CertificateStore::load(domains.as_slice(), &config.certs_dir)
            .wrap_err_with(|| format!("Failed to load certificates from {}", config.certs_dir))?;
        tracing::info!("Loaded {} certificates", store.len());
        Some(Arc::new(
            store
                .into_server_config()
                .context("Failed to build TLS configuration")?,
        ))
    } else {
        None
    };

    let gateway = Arc::new(GatewayService::new(config.clone(), |vhost| {
        Ok(Arc::new(HttpClientAdapter::for_vhost(vhost)?) as Arc<dyn HttpClient>)
    })?);

    let (access_log, log_writer) = FileAccessLog::open(&config.log_dir, config.access_log_queue)
        .await
        .context("Failed to open access log")?;
    let access_log: Arc<dyn AccessLog> = Arc::new(access_log);

    let tls_listener = match tls_config {
        Some(tls) => Some((bind(&config.listen_addr).await?, tls)),
        None => None,
    };
    let plain_listener = match &config.http_listen_addr {
        Some(addr) => Some(bind(addr).await?),
        None => None,
    };

    let shutdown = GracefulShutdown::new();
    let mut servers = JoinSet::new();

    if let Some((listener, tls)) = tls_listener {
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        let pipeline = Pipeline::new(gateway.clone(), access_log.clone());
        let router = Arc::new(HttpHandler::new(Arc::new(pipeline))).router();

        let acceptor = tokio_rustls::TlsAcceptor::from(tls);
        let listener = AxumListener {
            stream: TlsListener::new(acceptor, listener),
            local_addr,
        };
        tracing::info!("Echoes listening for TLS on {}", local_addr);
        servers.spawn(serve_router(
            listener,
            router,
            shutdown.token(),
            shutdown.drain_timeout(),
        ));
    }

    if let Some(listener) = plain_listener {
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        let https_port = config
            .listen_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(443);
        let pipeline = Pipeline::new(gateway.clone(), access_log.clone())
            .plaintext()
            .with_rewrite(HttpsRedirect::new(https_port));
        let router = Arc::new(HttpHandler::new(Arc::new(pipeline))).router();

        tracing::info!("Echoes listening for plain HTTP on {}", local_addr);
        servers.spawn(serve_router(
            listener,
            router,
            shutdown.token(),
            shutdown.drain_timeout(),
        ));
    }

    if servers.is_empty() {
        return Err(eyre!("No listener configured"));
    }

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.run_signal_handler().await {
            tracing::error!("Signal handler failed: {:#}", e);
            signals.trigger_shutdown(ShutdownReason::Manual);
        }
    });

    let mut result = Ok(());
    while let Some(joined) = servers.join_next().await {
        let outcome = joined
            .map_err(|e| eyre!("Listener task panicked: {e}"))
            .and_then(|served| served);
        if let Err(e) = outcome {
            tracing::error!("Listener stopped: {:#}", e);
            shutdown.trigger_shutdown(ShutdownReason::Manual);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    log_writer.shutdown(Duration::from_secs(5)).await;
    tracing::info!("Echoes stopped");
    result
}

async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address {addr}"))?;
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))
}

/// Serve until shutdown, then give open connections `drain` to finish.
async fn serve_router<L>(
    listener: L,
    router: Router,
    shutdown: CancellationToken,
    drain: Duration,
) -> Result<()>
where
    L: Listener<Addr = SocketAddr>,
{
    let server = axum::serve(
        listener.tap_io(|_| {}),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    drain_after_shutdown(async move { server.await }, shutdown, drain).await
}

async fn drain_after_shutdown<F>(server: F, shutdown: CancellationToken, drain: Duration) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => return result.context("Server error"),
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(drain, server).await {
        Ok(result) => result.context("Server error"),
        Err(_) => {
            tracing::warn!("Connections still open after {:?}, closing them", drain);
            Ok(())
        }
    }
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    let config = load_config_unchecked(config_path)
        .wrap_err_with(|| format!("Failed to read configuration from {config_path}"))?;
    if let Err(e) = GatewayConfigValidator::validate(&config) {
        println!("❌ Configuration validation failed:");
        println!("{e}");
        return Err(eyre!("Configuration {config_path} is invalid"));
    }

    println!("✅ Configuration validation: OK");
    println!();
    println!("📋 Configuration Summary:");
    println!("   • TLS Listen Address: {}", config.listen_addr);
    if let Some(addr) = &config.http_listen_addr {
        println!("   • HTTP Listen Address: {addr}");
    }
    println!("   • Virtual Hosts: {}", config.vhosts.len());
    for vhost in &config.vhosts {
        println!(
            "     - {} ({:?}, {} upstreams, https: {}, max_fails: {})",
            vhost.server_name.join(", "),
            vhost.load_balance,
            vhost.upstreams.len(),
            vhost.enable_https,
            vhost.max_fails
        );
    }
    if config.tls_enabled() {
        println!("   • Certificates: {}", config.tls_domains().join(", "));
    }
    Ok(())
}
