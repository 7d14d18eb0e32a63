//! Container engine abstraction and the Docker implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("image build produced no image id")]
    MissingImageId,
}

/// The container runtime, reduced to the six operations the control plane
/// needs. Implemented by [`DockerEngine`] in production and by stubs in
/// tests.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image from a tarred build context; returns the image id.
    async fn build_image(
        &self,
        context_tar: Vec<u8>,
        build_args: &HashMap<String, String>,
    ) -> EngineResult<String>;

    /// Create a container from an image, binding `port` on the host to the
    /// same port in the container; returns the container id.
    async fn create_container(&self, image_id: &str, port: u16) -> EngineResult<String>;

    async fn start_container(&self, container_id: &str) -> EngineResult<()>;

    async fn stop_container(&self, container_id: &str) -> EngineResult<()>;

    async fn remove_container(&self, container_id: &str) -> EngineResult<()>;

    async fn remove_image(&self, image_id: &str) -> EngineResult<()>;
}

/// Docker daemon client via bollard.
pub struct DockerEngine {
    docker: Docker,
    stop_grace_secs: i64,
}

impl DockerEngine {
    /// Connect using the local daemon defaults (socket or named pipe) and
    /// log the server version as a liveness check.
    pub async fn connect(stop_grace_secs: i64) -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let version = docker.version().await?;
        info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "connected to docker engine"
        );
        Ok(Self {
            docker,
            stop_grace_secs,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(
        &self,
        context_tar: Vec<u8>,
        build_args: &HashMap<String, String>,
    ) -> EngineResult<String> {
        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            buildargs: build_args.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context_tar)));

        let mut image_id = None;
        while let Some(item) = stream.next().await {
            let progress = item?;
            if let Some(message) = progress.stream.as_deref() {
                let message = message.trim();
                if !message.is_empty() {
                    debug!("docker build: {message}");
                }
            }
            if let Some(error) = progress.error {
                return Err(EngineError::Build(error));
            }
            if let Some(aux) = progress.aux
                && let Some(id) = aux.id
            {
                image_id = Some(id);
            }
        }
        image_id.ok_or(EngineError::MissingImageId)
    }

    async fn create_container(&self, image_id: &str, port: u16) -> EngineResult<String> {
        let port_key = format!("{port}/tcp");

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );

        let config = Config {
            image: Some(image_id.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container::<String, String>(None, config)
            .await?;
        debug!(container_id = %response.id, %image_id, "created container");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        self.docker
            .start_container::<String>(container_id, None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> EngineResult<()> {
        self.docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: self.stop_grace_secs,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> EngineResult<()> {
        self.docker
            .remove_container(container_id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> EngineResult<()> {
        self.docker.remove_image(image_id, None, None).await?;
        Ok(())
    }
}
