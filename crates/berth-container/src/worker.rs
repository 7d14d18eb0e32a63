//! Bounded async worker for image builds and container lifecycle.
//!
//! Every submit_* sets the in-progress state synchronously, then hands the
//! slow engine work to a pooled task. Terminal states are written with a
//! compare-and-swap against the in-progress value, so a worker finishing
//! late never overwrites the effect of a concurrent command.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use berth_core::config::DockerConfig;
use berth_core::state::AppState;
use berth_store::{ResourceStore, StoreError, StoreResult, UNSET_ID};

use crate::engine::{ContainerEngine, EngineError};

const DOCKERFILE_TEMPLATE: &str = include_str!("templates/Dockerfile");
const RUN_SCRIPT_TEMPLATE: &str = include_str!("templates/run.sh");
/// Name the compiled artifact is staged under inside the build context;
/// the Dockerfile template references it.
const STAGED_ARTIFACT: &str = "app.jar";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct BuildSettings {
    settle_delay: Duration,
    artifact_path: PathBuf,
    http_proxy: String,
    https_proxy: String,
}

pub struct ContainerWorker {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<ResourceStore>,
    permits: Arc<Semaphore>,
    settings: BuildSettings,
}

impl ContainerWorker {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<ResourceStore>,
        config: &DockerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            permits: Arc::new(Semaphore::new(config.pool_size)),
            settings: BuildSettings {
                settle_delay: Duration::from_secs(config.settle_delay_secs),
                artifact_path: config.artifact_path.clone(),
                http_proxy: config.http_proxy.clone(),
                https_proxy: config.https_proxy.clone(),
            },
        }
    }

    /// Remove a workload's container and image if present, resetting the
    /// stored ids to their sentinels. Containers must go before their
    /// image. Called by the gatekeeper ahead of deploy/compile/update/
    /// delete to guarantee at most one live container per workload.
    pub async fn teardown_artifacts(&self, uuid: Uuid) -> Result<(), WorkerError> {
        let data = self.store.image_data(uuid)?;
        if data.has_container() {
            self.engine.remove_container(&data.container_id).await?;
            self.store.set_container_id(uuid, UNSET_ID)?;
        }
        if data.has_image() {
            self.engine.remove_image(&data.image_id).await?;
            self.store.set_image_id(uuid, UNSET_ID)?;
        }
        Ok(())
    }

    /// Queue an image build. DEPLOYING is set before this returns.
    pub fn submit_build(&self, uuid: Uuid) -> StoreResult<()> {
        info!(%uuid, "queueing deployment");
        self.store.set_state(uuid, AppState::Deploying)?;
        let engine = self.engine.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            Self::build_worker(engine, store, settings, uuid).await;
        });
        Ok(())
    }

    /// Queue a container start. STARTING is set before this returns.
    pub fn submit_start(&self, uuid: Uuid) -> StoreResult<()> {
        info!(%uuid, "queueing start");
        self.store.set_state(uuid, AppState::Starting)?;
        let engine = self.engine.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        let settle_delay = self.settings.settle_delay;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            Self::start_worker(engine, store, settle_delay, uuid).await;
        });
        Ok(())
    }

    /// Queue a container stop. TERMINATING is set before this returns.
    pub fn submit_stop(&self, uuid: Uuid) -> StoreResult<()> {
        info!(%uuid, "queueing stop");
        self.store.set_state(uuid, AppState::Terminating)?;
        let engine = self.engine.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            Self::stop_worker(engine, store, uuid).await;
        });
        Ok(())
    }

    async fn build_worker(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<ResourceStore>,
        settings: BuildSettings,
        uuid: Uuid,
    ) {
        info!(%uuid, "deploying data app");
        let result = Self::run_build(&*engine, &store, &settings, uuid).await;
        let advanced = match result {
            Ok(()) => store.advance_state_if(uuid, AppState::Deploying, AppState::Deployed),
            Err(error) => {
                error!(%uuid, %error, "docker build failed");
                store.advance_state_if(uuid, AppState::Deploying, AppState::DeploymentError)
            }
        };
        if let Err(error) = advanced {
            error!(%uuid, %error, "failed to persist deployment result");
        }
        if let Err(error) = store.remove_temp_dir(uuid) {
            warn!(%uuid, %error, "failed to remove build folder");
        }
    }

    async fn run_build(
        engine: &dyn ContainerEngine,
        store: &ResourceStore,
        settings: &BuildSettings,
        uuid: Uuid,
    ) -> Result<(), WorkerError> {
        // Stage the build context: compiled artifact plus the container
        // template files, with line endings normalized for the image.
        let tmp = store.create_temp_dir(uuid)?;
        let artifact = store
            .layout()
            .repository_dir(uuid)
            .join(&settings.artifact_path);
        fs::copy(&artifact, tmp.join(STAGED_ARTIFACT))?;
        fs::write(
            tmp.join("Dockerfile"),
            DOCKERFILE_TEMPLATE.replace("\r\n", "\n"),
        )?;
        fs::write(tmp.join("run.sh"), RUN_SCRIPT_TEMPLATE.replace("\r\n", "\n"))?;

        // First build allocates the port; rebuilds reuse the stored one.
        let previous = store.image_data(uuid)?;
        let port = if previous.has_port() {
            previous.port
        } else {
            store.allocate_port(uuid)
        };

        let build_args = HashMap::from([
            ("http_proxy".to_string(), settings.http_proxy.clone()),
            ("https_proxy".to_string(), settings.https_proxy.clone()),
            ("app_port".to_string(), port.to_string()),
        ]);

        let context = tar_directory(&tmp)?;
        let image_id = engine.build_image(context, &build_args).await?;
        info!(%uuid, %image_id, "docker build finished");

        if previous.has_image() {
            info!(%uuid, old_image = %previous.image_id, "removing stale image");
            // A container referencing the stale image has to go first.
            if previous.has_container() {
                engine.remove_container(&previous.container_id).await?;
                store.set_container_id(uuid, UNSET_ID)?;
            }
            engine.remove_image(&previous.image_id).await?;
        } else {
            store.set_port(uuid, port)?;
        }
        store.set_image_id(uuid, &image_id)?;
        Ok(())
    }

    async fn start_worker(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<ResourceStore>,
        settle_delay: Duration,
        uuid: Uuid,
    ) {
        info!(%uuid, "starting data app");
        let result = async {
            let data = store.image_data(uuid)?;
            if data.has_container() {
                info!(%uuid, container_id = %data.container_id, "removing old container");
                engine.remove_container(&data.container_id).await?;
            }
            let container_id = engine.create_container(&data.image_id, data.port).await?;
            store.set_container_id(uuid, &container_id)?;
            engine.start_container(&container_id).await?;
            info!(%uuid, %container_id, "container started");
            // Give the workload time to come up before reporting RUNNING.
            tokio::time::sleep(settle_delay).await;
            Ok::<(), WorkerError>(())
        }
        .await;

        match result {
            Ok(()) => {
                if let Err(error) =
                    store.advance_state_if(uuid, AppState::Starting, AppState::Running)
                {
                    error!(%uuid, %error, "failed to persist running state");
                }
            }
            Err(error) => error!(%uuid, %error, "failed to start data app"),
        }
    }

    async fn stop_worker(engine: Arc<dyn ContainerEngine>, store: Arc<ResourceStore>, uuid: Uuid) {
        info!(%uuid, "stopping data app");
        let result = async {
            let data = store.image_data(uuid)?;
            engine.stop_container(&data.container_id).await?;
            info!(%uuid, container_id = %data.container_id, "container stopped");
            Ok::<(), WorkerError>(())
        }
        .await;

        match result {
            Ok(()) => {
                if let Err(error) =
                    store.advance_state_if(uuid, AppState::Terminating, AppState::Terminated)
                {
                    error!(%uuid, %error, "failed to persist terminated state");
                }
            }
            Err(error) => error!(%uuid, %error, "failed to stop data app"),
        }
    }
}

fn tar_directory(dir: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}
