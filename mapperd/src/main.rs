#![deny(unsafe_code)]

//! The mapper daemon: registers with the device-management control
//! plane, owns the device registry and per-device reconciliation
//! loops, and serves the lifecycle RPCs and the admin HTTP API.

use mapper_api::{
    types::device::{MySqlClientConfig, STATUS_OK},
    Result,
};
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, info_span, warn, Instrument};

mod config;
mod data;
mod device;
mod grpc;
mod httpd;
mod parse;
mod registry;

use data::{DataModel, SinkSet};
use grpc::client::Reporter;
use registry::DevicePanel;

// Initializes the application. It determines the configuration and
// sets up the logger. It returns `Some(Config)` with the found
// configuration if the application is to run, `None` if the program
// should exit (because `--print-config` was given, for instance).

async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

// Connects the MySQL recorder from the static config and proves the
// path with one self-test row. Failures are logged; the recorder
// then connects lazily from per-property configs instead.

async fn mysql_self_test(cfg: &config::Config, sinks: &SinkSet) {
    let mysql = &cfg.database.mysql;

    if !mysql.enabled {
        info!("MySQL recorder disabled in config");
        return;
    }

    // Export the password so lazily-initialized handles can find it.

    if !mysql.password.is_empty() {
        env::set_var("MYSQL_PASSWORD", &mysql.password);
    }

    let client_cfg = MySqlClientConfig {
        addr: mysql.addr.clone(),
        port: mysql.port,
        database: mysql.database.clone(),
        user_name: mysql.username.clone(),
        password: if mysql.password.is_empty() {
            None
        } else {
            Some(mysql.password.clone())
        },
    };

    match sinks.mysql.set_db(&client_cfg).await {
        Ok(()) => {
            let dm = DataModel::new(
                "default",
                "mysql-selftest",
                "ping",
                "ok",
                chrono::Utc::now().timestamp_millis(),
            );

            if sinks.mysql.record(&client_cfg, &dm).await.is_ok() {
                info!("MySQL self-test OK");
            } else {
                error!("MySQL self-test insert failed");
            }
        }
        Err(e) => error!(
            "MySQL init failed (host={} db={} user={}) -- {}",
            &mysql.addr, &mysql.database, &mysql.username, &e
        ),
    }
}

async fn wait_uds_ready(path: &str, timeout: Duration) -> bool {
    let mut waited = Duration::ZERO;
    let step = Duration::from_millis(100);

    while waited < timeout {
        if tokio::fs::metadata(path).await.is_ok() {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    false
}

// Waits for the first SIGINT/SIGTERM and returns its number. Every
// 30 seconds devices that aren't reporting ok get a warning line.

async fn wait_for_shutdown(panel: &Arc<DevicePanel>) -> Result<i32> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut ticks = 0u32;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down gracefully");
                return Ok(libc_signo::SIGINT);
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down gracefully");
                return Ok(libc_signo::SIGTERM);
            }
            _ = tick.tick() => {
                ticks += 1;
                if ticks >= 30 {
                    ticks = 0;
                    for dev in panel.registry.snapshot() {
                        let status = dev.status().await;

                        if status != STATUS_OK {
                            warn!("device {} status: {}", dev.name(), &status);
                        }
                    }
                }
            }
        }
    }
}

// Signal numbers, spelled out so the exit code math reads plainly.

mod libc_signo {
    pub const SIGINT: i32 = 2;
    pub const SIGTERM: i32 = 15;
}

// A second signal during shutdown forces the process out with the
// conventional 128+signo code.

fn spawn_force_exit() {
    tokio::spawn(async {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let signo = tokio::select! {
            _ = sigint.recv() => libc_signo::SIGINT,
            _ = sigterm.recv() => libc_signo::SIGTERM,
        };

        warn!("received a second signal, forcing exit");
        std::process::exit(128 + signo);
    });
}

async fn run() -> Result<()> {
    let cfg = match init_app().await {
        Some(cfg) => cfg,
        None => return Ok(()),
    };

    info!("=== edge device mapper starting ===");

    // SIGPIPE is already ignored by the runtime; writes to closed
    // sinks surface as errors instead of killing the process.

    let sinks = Arc::new(SinkSet::new());

    mysql_self_test(&cfg, &sinks).await;

    let reporter = Reporter::from_env();
    let panel = DevicePanel::new(Arc::clone(&sinks), reporter);

    // The lifecycle RPC server must be up before registration so the
    // control plane can call back immediately.

    let sock_path = cfg.grpc_server.socket_path.clone();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let grpc_task = tokio::spawn(
        grpc::server::serve(Arc::clone(&panel), sock_path.clone(), shutdown_rx)
            .instrument(info_span!("grpc")),
    );

    if !wait_uds_ready(&sock_path, Duration::from_secs(3)).await {
        warn!("gRPC socket not ready yet: {}", &sock_path);
    }
    if grpc_task.is_finished() {
        error!("gRPC server failed to start");
        return Err(mapper_api::Error::OperationError(String::from(
            "gRPC server failed to start",
        )));
    }

    info!("mapper will register with the control plane");

    let (devices, models) =
        match grpc::client::register_mapper(&cfg, true).await {
            Ok(lists) => lists,
            Err(e) => {
                error!("failed to register mapper -- {}", &e);
                let _ = shutdown_tx.send(());
                let _ = grpc_task.await;
                let _ = tokio::fs::remove_file(&sock_path).await;
                return Err(e);
            }
        };

    panel.init_devices(devices, models);

    // Devices start in the background so startup stays responsive.

    {
        let panel = Arc::clone(&panel);

        tokio::spawn(
            async move { panel.registry.start_all().await }
                .instrument(info_span!("start_all")),
        );
    }

    let http_task = cfg.common.http_port.map(|port| {
        tokio::spawn(
            httpd::server(Arc::clone(&panel), port)
                .instrument(info_span!("httpd")),
        )
    });

    if http_task.is_none() {
        info!("admin HTTP server disabled (no port configured)");
    }

    info!("=== mapper startup completed, running ===");

    let _signo = wait_for_shutdown(&panel).await?;

    spawn_force_exit();

    // Shutdown order: admin surface, device loops, RPC server,
    // socket file, sink connections.

    if let Some(http_task) = http_task {
        http_task.abort();
    }

    panel.registry.stop_all().await;

    let _ = shutdown_tx.send(());
    let _ =
        tokio::time::timeout(Duration::from_secs(3), grpc_task).await;
    let _ = tokio::fs::remove_file(&sock_path).await;

    sinks.close().await;

    info!("=== mapper shutdown completed ===");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {}", &e);
        std::process::exit(1);
    }
}
