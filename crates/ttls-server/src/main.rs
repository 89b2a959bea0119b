use clap::Parser;
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use ttls_server::{Config, MemoryUserStore};

/// USG EAP-TTLS Server - RFC 5281 EAP-TTLS Authenticator
///
/// Loads the configuration, user database and server certificate and builds
/// the authenticator. There is no RADIUS transport in this binary; embed
/// `TtlsAuthenticator` in a server to authenticate peers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "usg_ttls")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit
    #[arg(short, long)]
    validate: bool,
}

fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            warn!("Could not load config file from {}: {}", cli.config_path, e);
            info!("Creating example configuration at: {}", cli.config_path);

            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }

            info!("Please edit {} and restart the server", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        println!("Configuration validated successfully!");
        println!();
        println!("Configuration summary:");
        println!("  Max version: {}", config.ttls.max_version);
        println!("  Fragment size: {}", config.ttls.fragment_size);
        println!("  TNC: {}", config.ttls.tnc);
        println!("  Session timeout: {}s", config.ttls.session_timeout);
        match &config.tls {
            Some(tls) => println!("  Certificate: {} (key {})", tls.cert_path, tls.key_path),
            None => println!("  WARNING: No TLS certificate configured!"),
        }
        println!(
            "  Users: {} outer, {} tunneled",
            config.users.iter().filter(|u| u.outer).count(),
            config.users.iter().filter(|u| !u.outer).count()
        );
        println!("  Log level: {}", config.log_level.as_deref().unwrap_or("info"));
        process::exit(0);
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("USG EAP-TTLS Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);

    let users = match MemoryUserStore::from_config(&config) {
        Ok(users) => users,
        Err(e) => {
            error!("Invalid user configuration: {}", e);
            process::exit(1);
        }
    };
    info!("Loaded {} user entries", users.len());
    if config.ttls.max_version > 0 {
        warn!("EAP-TTLSv1 requested; the rustls tunnel has no TLS/IA and will use version 0");
    }

    #[cfg(feature = "tls")]
    {
        use std::sync::Arc;
        use ttls_proto::{BuiltinMethods, RustlsTunnelFactory};
        use ttls_server::TtlsAuthenticator;

        let Some(tls) = &config.tls else {
            error!("No TLS certificate configured");
            process::exit(1);
        };

        let tunnels = match RustlsTunnelFactory::from_pem_files(&tls.cert_path, &tls.key_path) {
            Ok(tunnels) => tunnels,
            Err(e) => {
                error!("Failed to load TLS certificate: {}", e);
                process::exit(1);
            }
        };

        let authenticator = TtlsAuthenticator::new(
            config.ttls.session_config(),
            Arc::new(tunnels),
            Arc::new(users),
            Arc::new(BuiltinMethods),
        )
        .with_session_timeout(config.ttls.session_timeout());
        info!("Authenticator built: {:?}", authenticator);
        info!("No RADIUS transport in this binary; configuration check complete, exiting");
    }

    #[cfg(not(feature = "tls"))]
    {
        let _ = users;
        error!("Built without the `tls` feature; no tunnel backend available");
        process::exit(1);
    }
}
