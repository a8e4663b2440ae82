mod agent;
mod collectors;
mod config;
mod http;
mod ingest;
mod metrics;
mod payload;
mod query;
mod state;
mod storage;
mod submitter;
mod tree;

use agent::{Agent, LoopExit};
use axum::serve;
use clap::{Parser, Subcommand};
use collectors::system::SysinfoSource;
use config::{resolve_api_key, Config};
use http::{ApiSettings, HttpAppState};
use metrics::Metrics;
use state::AgentState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storage::{now_ms, Store};
use submitter::Submitter;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proccensus")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml", global = true)]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Periodically collect the process table and send it to the server.
    Agent,
    /// Accept snapshots and serve the query API.
    Server,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }
    let Some(command) = cli.command else {
        error!("не указана подкоманда: agent или server");
        std::process::exit(2);
    };

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let code = match command {
        Command::Agent => run_agent(cfg).await,
        Command::Server => run_server(cfg).await,
    };
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run_agent(cfg: Config) -> i32 {
    let cfg = cfg.agent;
    let api_key = match resolve_api_key(&cfg.api_key_env, cfg.api_key.as_deref()) {
        Ok(key) => key,
        Err(err) => {
            error!(error = %err, "не удалось получить API-ключ агента");
            return 1;
        }
    };
    let submitter = match Submitter::new(
        &cfg.backend_url,
        api_key,
        Duration::from_secs(cfg.request_timeout_secs),
    ) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "не удалось создать HTTP-клиент");
            return 1;
        }
    };

    info!(
        endpoint = submitter.endpoint(),
        interval_secs = cfg.interval_secs,
        max_processes = cfg.max_processes,
        "запуск агента proccensus"
    );

    let source = SysinfoSource::new(cfg.collect_system_metrics);
    let mut agent = Agent::new(source, submitter, &cfg);
    let mut state = AgentState::new(now_unix());

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
        }
    };
    let period = Duration::from_secs(cfg.interval_secs);
    match agent.run_until(&mut state, period, shutdown).await {
        LoopExit::Shutdown => {
            info!(
                cycles = state.cycles_run,
                uptime_secs = state.uptime_secs(now_unix()),
                "получен Ctrl+C, агент останавливается"
            );
            0
        }
        LoopExit::AuthRejected => {
            error!("API-ключ отклонён сервером, агент остановлен");
            1
        }
    }
}

async fn run_server(cfg: Config) -> i32 {
    let cfg = cfg.server;
    let api_key = match resolve_api_key(&cfg.api_key_env, cfg.api_key.as_deref()) {
        Ok(key) => key,
        Err(err) => {
            error!(error = %err, "не удалось получить API-ключ сервера");
            return 1;
        }
    };
    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
            return 1;
        }
    };
    let store = match Store::open(&cfg.database_path).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, path = %cfg.database_path, "не удалось открыть базу данных");
            return 1;
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            return 1;
        }
    };
    match store.active_host_count().await {
        Ok(active) => metrics.set_active_hosts(active),
        Err(err) => warn!(error = %err, "не удалось подсчитать активные хосты"),
    }

    info!(
        listen = %addr,
        database = %cfg.database_path,
        max_body_bytes = cfg.max_body_bytes,
        "запуск сервера proccensus"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let state = HttpAppState {
            metrics: metrics.clone(),
            store: store.clone(),
            settings: Arc::new(ApiSettings::from_config(&cfg, api_key)),
        };
        let app = http::build_router(state, cfg.max_body_bytes);
        let mut shutdown_rx = shutdown_rx.clone();
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                error!(error = %err, "не удалось запустить HTTP-сервер");
                return 1;
            }
        };
        tokio::spawn(async move {
            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let sweep_task = {
        let store = store.clone();
        let metrics = metrics.clone();
        let retention = cfg.retention.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(retention.sweep_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла очистки");
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.sweep(now_ms(), retention.clone()).await {
                            Ok(report) => {
                                metrics.record_sweep(
                                    report.hosts_deactivated,
                                    report.snapshots_pruned,
                                    report.active_hosts,
                                );
                                if report.hosts_deactivated > 0 || report.snapshots_pruned > 0 {
                                    info!(
                                        hosts_deactivated = report.hosts_deactivated,
                                        snapshots_pruned = report.snapshots_pruned,
                                        active_hosts = report.active_hosts,
                                        "очистка устаревших данных"
                                    );
                                }
                            }
                            Err(err) => error!(error = %err, "ошибка очистки устаревших данных"),
                        }
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    let _ = sweep_task.await;
    let _ = http_task.await;
    0
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
