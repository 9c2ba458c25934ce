// ABOUTME: Wires the lifecycle backend, pool manager, health monitor and HTTP service together
// ABOUTME: Runs until a shutdown signal or fatal pool condition, then drains every sandbox

use anyhow::{bail, Context, Result};
use sandpool_api::{create_router, AppState};
use sandpool_sandbox::{
    BackendKind, DockerProvider, HealthMonitor, InMemoryProvider, PoolManager,
    ProvisioningController, RemoteEnvProvider,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{EnvConfig, ServeArgs};

/// Construct the lifecycle backend selected by the environment
pub fn build_controller(
    env: &EnvConfig,
    args: &ServeArgs,
) -> Result<Arc<dyn ProvisioningController>> {
    let controller: Arc<dyn ProvisioningController> = match env.backend {
        BackendKind::Memory => Arc::new(InMemoryProvider::new()),
        BackendKind::Docker => Arc::new(
            DockerProvider::new(env.docker_config(args.readiness_timeout()))
                .context("Failed to connect to Docker")?,
        ),
        BackendKind::Remote => Arc::new(
            RemoteEnvProvider::new(env.remote_config(args.readiness_timeout())?)
                .context("Failed to configure remote environment backend")?,
        ),
    };
    Ok(controller)
}

/// A warmed-up pool with its monitor running, ready to be served
pub struct Scheduler {
    pub pool: Arc<PoolManager>,
    monitor: HealthMonitor,
    state: AppState,
}

impl Scheduler {
    /// Validate settings, warm the pool to baseline and start the monitor
    pub async fn start(
        controller: Arc<dyn ProvisioningController>,
        args: &ServeArgs,
        env: &EnvConfig,
    ) -> Result<Self> {
        let settings = args.pool_settings()?;

        let available = controller
            .is_available()
            .await
            .with_context(|| format!("Failed to reach {} backend", controller.name()))?;
        if !available {
            bail!("{} backend is not available", controller.name());
        }

        info!(
            backend = controller.name(),
            baseline = settings.baseline_size,
            max = settings.max_size,
            cpu_millicores = settings.resource_spec.cpu_millicores,
            memory_mb = settings.resource_spec.memory_mb(),
            recycle = settings.recycle.as_str(),
            "Starting sandbox pool"
        );

        let pool = PoolManager::new(controller, settings)?;
        let snapshot = pool.warm_up().await?;
        let fatal = pool.fatal_signal().borrow().clone();
        if let Some(reason) = fatal {
            pool.shutdown().await?;
            bail!("Pool failed during warm up: {}", reason);
        }
        info!(
            free = snapshot.counts.free,
            total = snapshot.counts.total,
            "Pool warmed up"
        );

        let monitor = HealthMonitor::new(pool.clone());
        monitor.start().await;

        let state = AppState::new(pool.clone())
            .with_request_timeout(args.request_timeout())
            .with_session_root(env.session_root.clone());

        Ok(Self {
            pool,
            monitor,
            state,
        })
    }

    /// Serve the scheduling API until `shutdown` resolves or the pool raises a fatal
    /// condition. Every sandbox is terminated before this returns.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fatal = self.pool.fatal_signal();
        let app = create_router(self.state.clone());

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Scheduling service listening");
        }

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(drain_on(shutdown, self.pool.clone()))
            .await;

        self.monitor.stop().await;
        if self.pool.is_accepting() {
            if let Err(e) = self.pool.shutdown().await {
                error!(error = %e, "Pool shutdown failed");
            }
        }

        served.context("HTTP server failed")?;
        let reason = fatal.borrow().clone();
        if let Some(reason) = reason {
            bail!("Scheduler stopped after fatal error: {}", reason);
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

/// Start the scheduler and serve until SIGINT, SIGTERM or a fatal condition
pub async fn run(args: ServeArgs, env: EnvConfig) -> Result<()> {
    let controller = build_controller(&env, &args)?;
    let scheduler = Scheduler::start(controller, &args, &env).await?;

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?;

    scheduler.serve(listener, shutdown_signal()).await
}

/// Wait for a stop condition, then fail queued acquires and terminate every slot
/// while the server finishes in-flight requests.
async fn drain_on<F>(shutdown: F, pool: Arc<PoolManager>)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => {}
        reason = wait_for_fatal(pool.fatal_signal()) => {
            error!(reason = %reason, "Fatal pool condition, shutting down");
        }
    }

    if let Err(e) = pool.shutdown().await {
        error!(error = %e, "Pool shutdown failed");
    }
}

async fn wait_for_fatal(mut fatal: watch::Receiver<Option<String>>) -> String {
    loop {
        let current = fatal.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if fatal.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
