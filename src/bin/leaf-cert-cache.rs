use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leaf_cert_cache::{CaState, CacheConfig, CachedSigner, RcgenSigner, TlsAcceptor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Cache for TLS leaf certificates signed on demand by an ephemeral CA.
#[derive(Parser, Debug)]
#[command(name = "leaf-cert-cache")]
#[command(version, about)]
struct Args {
    /// Path to the cache configuration file (YAML).
    /// If not specified, built-in defaults are used.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign a certificate for a host set, repeatedly, through the cache.
    Sign {
        /// Hostnames or IP addresses the certificate must cover.
        #[arg(required = true)]
        hosts: Vec<String>,

        /// Number of times to request the certificate.
        #[arg(long, default_value_t = 2)]
        repeat: usize,
    },
    /// Terminate TLS connections with cached leaf certificates.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8443")]
        listen: SocketAddr,

        /// Write the CA certificate (PEM) to this file.
        #[arg(long)]
        ca_out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = match args.config {
        Some(config_path) => CacheConfig::load(&config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?,
        None => CacheConfig::default(),
    };

    let ca = Arc::new(CaState::generate().context("failed to generate CA")?);
    let signer = Arc::new(CachedSigner::from_config(
        RcgenSigner::new(config.leaf_validity),
        &config,
    ));

    let result = match args.command {
        Command::Sign { hosts, repeat } => sign(&signer, &ca, &hosts, repeat).await,
        Command::Serve { listen, ca_out } => serve(Arc::clone(&signer), ca, listen, ca_out).await,
    };

    signer.shutdown().await;
    result
}

async fn sign(
    signer: &CachedSigner<RcgenSigner>,
    ca: &Arc<CaState>,
    hosts: &[String],
    repeat: usize,
) -> Result<()> {
    for attempt in 1..=repeat {
        let cached = signer.lookup(hosts).is_some();
        let started = Instant::now();
        let cert = signer
            .sign_host(ca, hosts)
            .await
            .with_context(|| format!("failed to sign certificate for {}", hosts.join(", ")))?;

        println!(
            "#{attempt}: {} in {:?} (chain length {})",
            if cached { "cached" } else { "generated" },
            started.elapsed(),
            cert.cert.len()
        );
    }
    Ok(())
}

async fn serve(
    signer: Arc<CachedSigner<RcgenSigner>>,
    ca: Arc<CaState>,
    listen: SocketAddr,
    ca_out: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = ca_out {
        tokio::fs::write(&path, ca.ca_cert_pem())
            .await
            .with_context(|| format!("failed to write CA certificate to {:?}", path))?;
        info!("wrote CA certificate to {}", path.display());
    }

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!("listening on {}", listener.local_addr()?);

    let acceptor = TlsAcceptor::new(signer, ca);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        };
        debug!("accepted connection from {}", peer_addr);

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok((mut tls_stream, sni)) => {
                    info!("terminated TLS for {} from {}", sni, peer_addr);
                    let greeting = format!("leaf-cert-cache served {}\n", sni);
                    if let Err(e) = tls_stream.write_all(greeting.as_bytes()).await {
                        warn!("failed to write to {}: {}", peer_addr, e);
                    }
                    let _ = tls_stream.shutdown().await;
                }
                Err(e) => warn!("connection from {} failed: {}", peer_addr, e),
            }
        });
    }
}
