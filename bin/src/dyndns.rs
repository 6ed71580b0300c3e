// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `dyndns` binary for running a dynamic DNS server
//!
//! ```text
//! Usage: dyndns [options]
//!       dyndns (-h | --help | --version)
//!
//! Options:
//!    -q, --quiet                  Disable INFO messages, WARN and ERROR will remain
//!    -d, --debug                  Turn on DEBUG messages (default is only INFO)
//!    -h, --help                   Show this message
//!    -V, --version                Show the version of dyndns
//!    -c FILE, --config-file=FILE  Path to configuration file, default is conf.toml
//!    -a FILE, --auth-file=FILE    Path to authentication file, default is auth.toml
//!    --data-path=DIR              Where record files are kept, default is ./
//!    --enable-debug-mode          List all records on the index page of the HTTP server
//! ```

// BINARY WARNINGS
#![warn(
    clippy::dbg_macro,
    clippy::unimplemented,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]

use std::{
    env, fmt,
    io::Error,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use socket2::{Domain, Socket, Type};
use time::OffsetDateTime;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::{
    net::{TcpListener, UdpSocket},
    runtime,
};
use tracing::{error, info, warn, Event, Subscriber};
use tracing_subscriber::{
    fmt::{format, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use dyndns::Config;
use dyndns_server::{
    auth::{AuthFile, Authenticator},
    resolver::Resolver,
    store::{
        persistence::{FlushTask, Persistence},
        RecordStore,
    },
    web::{WebServer, WebState},
    ServerFuture,
};

/// Cli struct for all options managed with clap derive api.
#[derive(Debug, Parser)]
#[clap(name = "dyndns", version, about)]
struct Cli {
    /// Test validation of configuration and authentication files
    #[clap(long = "validate")]
    pub(crate) validate: bool,

    /// Number of runtime workers, defaults to the number of CPU cores
    #[clap(long = "workers")]
    pub(crate) workers: Option<usize>,

    /// Disable INFO messages, WARN and ERROR will remain
    #[clap(short = 'q', long = "quiet", conflicts_with = "debug")]
    pub(crate) quiet: bool,

    /// Turn on `DEBUG` messages (default is only `INFO`)
    #[clap(short = 'd', long = "debug", conflicts_with = "quiet")]
    pub(crate) debug: bool,

    /// Path to configuration file, created with defaults if missing
    #[clap(
        short = 'c',
        long = "config-file",
        default_value = "conf.toml",
        value_name = "FILE",
        value_hint=clap::ValueHint::FilePath,
    )]
    pub(crate) config_file: PathBuf,

    /// Path to authentication file, created empty if missing
    #[clap(
        short = 'a',
        long = "auth-file",
        default_value = "auth.toml",
        value_name = "FILE",
        value_hint=clap::ValueHint::FilePath,
    )]
    pub(crate) auth_file: PathBuf,

    /// Directory where the record files are kept
    #[clap(
        long = "data-path",
        default_value = "./",
        value_name = "DIR",
        value_hint=clap::ValueHint::DirPath,
    )]
    pub(crate) data_path: PathBuf,

    /// List all registered records on the index page of the HTTP server
    #[clap(long = "enable-debug-mode")]
    pub(crate) enable_debug_mode: bool,
}

/// Main method for running the dyndns server.
fn main() -> Result<(), String> {
    // the displayed message of the termination impl is not pretty
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), String> {
    let args = Cli::parse();
    if args.quiet {
        quiet()?;
    } else if args.debug {
        debug()?;
    } else {
        default()?;
    }

    info!("dyndns {} starting...", dyndns_server::version());

    // Load configuration files

    let config_path = args.config_file.as_path();
    info!("loading configuration from: {config_path:?}");

    let config = Config::read_or_create(config_path)
        .map_err(|err| format!("failed to read config file from {config_path:?}: {err}"))?;
    let domains = config
        .dns
        .domains()
        .map_err(|err| format!("failed to read domains from {config_path:?}: {err}"))?;
    let listen_addr = config
        .dns
        .listen_addr()
        .map_err(|err| format!("failed to read {config_path:?}: {err}"))?;
    let flush_interval = config
        .persistence
        .flush_interval()
        .map_err(|err| format!("failed to read {config_path:?}: {err}"))?;

    let auth_path = args.auth_file.as_path();
    info!("loading authentication from: {auth_path:?}");
    let auth_file = AuthFile::load(auth_path)
        .map_err(|err| format!("failed to read authentication file {auth_path:?}: {err}"))?;
    let authenticator = Authenticator::new(auth_file, config.auth.policy)
        .map_err(|err| format!("invalid authentication file {auth_path:?}: {err}"))?;

    if args.validate {
        info!("configuration files are validated");
        return Ok(());
    }

    let mut runtime = runtime::Builder::new_multi_thread();
    runtime.enable_all().thread_name("dyndns-runtime");
    if let Some(workers) = args.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime
        .build()
        .map_err(|err| format!("failed to initialize Tokio runtime: {err}"))?;

    let _guard = runtime.enter();

    #[cfg(unix)]
    let mut signal = signal(SignalKind::terminate())
        .map_err(|e| format!("failed to register signal handler: {e}"))?;

    // load the records
    let store = Arc::new(RecordStore::new(domains));
    if store.is_empty() {
        warn!("no domains configured, every query will be refused");
    }

    let persistence = Arc::new(Persistence::new(&args.data_path));
    let report = runtime.block_on(persistence.load(&store));
    info!(
        "loaded {} records from {:?}, skipped {} lines",
        report.records,
        persistence.data_path(),
        report.skipped_lines
    );
    for err in &report.errors {
        error!("{err}");
    }

    // DNS listeners
    let mut server = ServerFuture::new(Resolver::new(Arc::clone(&store)));

    info!("binding UDP to {listen_addr:?}");
    let udp_socket = build_udp_socket(listen_addr, config.dns.port)
        .map_err(|err| format!("failed to bind to UDP socket address {listen_addr:?}: {err}"))?;
    info!(
        "listening for UDP on {:?}",
        udp_socket
            .local_addr()
            .map_err(|err| format!("failed to lookup local address: {err}"))?
    );
    server.register_socket(udp_socket);

    if config.dns.tcp {
        info!("binding TCP to {listen_addr:?}");
        let tcp_listener = build_tcp_listener(listen_addr, config.dns.port)
            .map_err(|err| format!("failed to bind to TCP socket address {listen_addr:?}: {err}"))?;
        info!(
            "listening for TCP on {:?}",
            tcp_listener
                .local_addr()
                .map_err(|err| format!("failed to lookup local address: {err}"))?
        );
        server.register_listener(tcp_listener, config.dns.tcp_request_timeout());
    } else {
        info!("TCP protocol is disabled");
    }

    // HTTP listeners
    let mut web = WebServer::new(WebState::new(
        Arc::clone(&store),
        Arc::new(authenticator),
        args.enable_debug_mode,
    ));

    let http = &config.http;
    if !http.host.is_empty() {
        let listener = runtime
            .block_on(TcpListener::bind((http.host.as_str(), http.port)))
            .map_err(|err| {
                format!(
                    "failed to bind HTTP to {host}:{port}: {err}",
                    host = http.host,
                    port = http.port
                )
            })?;
        info!(
            "listening for HTTP on {:?}",
            listener
                .local_addr()
                .map_err(|err| format!("failed to lookup local address: {err}"))?
        );
        web.register_listener(listener);
    }

    if !http.socket.is_empty() {
        #[cfg(unix)]
        {
            let path = std::path::Path::new(&http.socket);
            let listener = dyndns_server::web::bind_unix_socket(path, http.socket_file_mode)
                .map_err(|err| format!("failed to bind HTTP socket {path:?}: {err}"))?;
            web.register_unix_listener(listener);
        }
        #[cfg(not(unix))]
        return Err("HTTP sockets are only supported on Unix systems".to_string());
    }

    let flush_task = FlushTask::spawn(Arc::clone(&persistence), Arc::clone(&store), flush_interval);

    {
        let token = server.shutdown_token().clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            tokio::select! {
                _ = signal.recv() => (),
                _ = tokio::signal::ctrl_c() => (),
            }
            #[cfg(not(unix))]
            let _ = tokio::signal::ctrl_c().await;

            info!("shutdown requested");
            token.cancel();
        });
    }

    info!("server starting up, awaiting connections...");
    let result = runtime.block_on(async {
        let result = server.block_until_done().await;
        web.stop().await;

        let report = flush_task.shutdown().await;
        for err in &report.errors {
            error!("final flush: {err}");
        }

        result
    });

    match result {
        Ok(()) => {
            info!("dyndns {} stopping", dyndns_server::version());
            Ok(())
        }
        Err(e) => {
            let error_msg = format!(
                "dyndns {} has encountered an error: {}",
                dyndns_server::version(),
                e
            );

            error!("{}", error_msg);
            Err(error_msg)
        }
    }
}

struct TdnsFormatter;

impl<S, N> FormatEvent<S, N> for TdnsFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = OffsetDateTime::now_utc();
        let now_secs = now.unix_timestamp();

        // Format values from the event's's metadata:
        let metadata = event.metadata();
        write!(
            &mut writer,
            "{}:{}:{}",
            now_secs,
            metadata.level(),
            metadata.target()
        )?;

        if let Some(line) = metadata.line() {
            write!(&mut writer, ":{line}")?;
        }

        // Format all the spans in the event's span context.
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.name())?;

                let ext = span.extensions();
                // Skip formatting the fields if the span had no fields.
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }

        // Write fields on the event
        write!(writer, ":")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn get_env() -> String {
    env::var("RUST_LOG").unwrap_or_default()
}

fn all_dyndns(level: impl ToString) -> String {
    format!(
        "dyndns={level},{env}",
        level = level.to_string().to_lowercase(),
        env = get_env()
    )
}

/// appends dyndns debug to RUST_LOG
pub fn debug() -> Result<(), String> {
    logger(tracing::Level::DEBUG)
}

/// appends dyndns info to RUST_LOG
pub fn default() -> Result<(), String> {
    logger(tracing::Level::INFO)
}

/// appends dyndns error to RUST_LOG
pub fn quiet() -> Result<(), String> {
    logger(tracing::Level::ERROR)
}

fn logger(level: tracing::Level) -> Result<(), String> {
    // Setup tracing for logging based on input
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse(all_dyndns(level))
        .map_err(|err| format!("failed to configure tracing/logging: {err}"))?;

    let formatter = tracing_subscriber::fmt::layer().event_format(TdnsFormatter);

    tracing_subscriber::registry()
        .with(formatter)
        .with(filter)
        .init();

    Ok(())
}

/// Build a TcpListener for a given IP, port pair; IPv6 listeners will not accept v4 connections
fn build_tcp_listener(ip: IpAddr, port: u16) -> Result<TcpListener, Error> {
    let sock = if ip.is_ipv4() {
        Socket::new(Domain::IPV4, Type::STREAM, None)?
    } else {
        let s = Socket::new(Domain::IPV6, Type::STREAM, None)?;
        s.set_only_v6(true)?;
        s
    };

    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;

    let s_addr = SocketAddr::new(ip, port);
    sock.bind(&s_addr.into())?;

    sock.listen(128)?;

    TcpListener::from_std(sock.into())
}

/// Build a UdpSocket for a given IP, port pair; IPv6 sockets will not accept v4 connections
fn build_udp_socket(ip: IpAddr, port: u16) -> Result<UdpSocket, Error> {
    let sock = if ip.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, None)?
    } else {
        let s = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
        s.set_only_v6(true)?;
        s
    };

    sock.set_nonblocking(true)?;

    let s_addr = SocketAddr::new(ip, port);
    sock.bind(&s_addr.into())?;

    UdpSocket::from_std(sock.into())
}
