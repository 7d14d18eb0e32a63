//! Lifecycle gatekeeper — one method per control-plane command.
//!
//! Every method follows the same shape: parse and validate the body,
//! check the transition table against the workload's current state,
//! delegate to the store/workers/gateways, write one audit-log line, and
//! serialize the accumulated status into the response. Commands that were
//! allowed to run also push the audit repository (`status` never does; a
//! rejected command's line rides along with the next push). Failures of
//! any delegated call are translated into status bits and never escape as
//! transport errors; illegal transitions are rejected before any mutation.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;
use uuid::Uuid;

use berth_core::message::{
    DispatchRequest, LifecycleResponse, RegisterRequest, UpdateRequest, UuidRequest,
    ValidationError,
};
use berth_core::state::{AppState, Command};
use berth_core::status::{Category, StatusCode};
use berth_compile::CompileWorker;
use berth_container::ContainerWorker;
use berth_dispatch::DispatchGateway;
use berth_store::ResourceStore;
use berth_vcs::{AuditRepo, GitCredentials};

pub struct Gatekeeper {
    store: Arc<ResourceStore>,
    audit: Arc<AuditRepo>,
    compile: CompileWorker,
    container: ContainerWorker,
    dispatch: DispatchGateway,
}

fn parse<T: DeserializeOwned>(body: &str, status: &mut StatusCode) -> Option<T> {
    match serde_json::from_str(body) {
        Ok(request) => Some(request),
        Err(error) => {
            status.record(Category::InputFormat, error.to_string());
            None
        }
    }
}

fn note_invalid(error: ValidationError, status: &mut StatusCode) {
    status.set(Category::InputFormat);
    for issue in error.issues {
        status.append(issue);
    }
}

fn respond(response: LifecycleResponse, status: &mut StatusCode) -> String {
    let finalized = response.finalize(status);
    match serde_json::to_string(&finalized) {
        Ok(body) => body,
        Err(error) => {
            status.record(Category::OutputFormat, error.to_string());
            let fallback = finalized.finalize(status);
            serde_json::to_string(&fallback).unwrap_or_else(|_| String::from("{}"))
        }
    }
}

impl Gatekeeper {
    pub fn new(
        store: Arc<ResourceStore>,
        audit: Arc<AuditRepo>,
        compile: CompileWorker,
        container: ContainerWorker,
        dispatch: DispatchGateway,
    ) -> Self {
        Self {
            store,
            audit,
            compile,
            container,
            dispatch,
        }
    }

    /// Append one audit-log line, folding an IO failure into the status.
    fn audit_event(&self, status: &mut StatusCode, uuid: Uuid, message: &str) {
        if let Err(error) = self.store.log_event(uuid, message) {
            status.record(Category::Io, error.to_string());
        }
    }

    fn audit_outcome(&self, status: &mut StatusCode, uuid: Uuid, success: &str, failure: &str) {
        let line = if status.is_success() {
            success.to_string()
        } else {
            format!("{failure} with error '{}'.", status.message())
        };
        self.audit_event(status, uuid, &line);
    }

    /// Push the audit repository, folding a failure into the status. Every
    /// mutating command ends here; the workload's own state update has
    /// already happened, so a push failure is reported but not fatal.
    fn push_audit(&self, status: &mut StatusCode, message: &str) {
        if let Err(error) = self.audit.commit_push_all(message) {
            status.record(Category::Vcs, error.to_string());
        }
    }

    /// Remove existing container/image artifacts, container first.
    async fn teardown(&self, status: &mut StatusCode, uuid: Uuid) {
        if let Err(error) = self.container.teardown_artifacts(uuid).await {
            status.record(Category::Io, error.to_string());
        }
    }

    fn load_origin_request(&self, uuid: Uuid) -> Result<RegisterRequest, String> {
        let raw = self.store.load_origin(uuid).map_err(|error| error.to_string())?;
        serde_json::from_str(&raw).map_err(|error| error.to_string())
    }

    // ── Commands ───────────────────────────────────────────────────

    /// `/register/git` — allocate a UUID, clone the workload's repository,
    /// record it as REGISTERED. Any failure rolls the registration back
    /// completely and returns the nil UUID.
    pub async fn register(&self, body: &str) -> String {
        info!("received register/git request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<RegisterRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        }

        // The origin record is the masked registration request; it is what
        // `update` later re-reads to recover the repository URL.
        let origin = match serde_json::to_string(&request.masked()) {
            Ok(origin) => origin,
            Err(error) => {
                status.record(Category::OutputFormat, error.to_string());
                return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
            }
        };

        let uuid = match self.store.register(&origin) {
            Ok(uuid) => uuid,
            Err(error) => {
                status.record(Category::Io, error.to_string());
                let _ = self
                    .store
                    .log_system(&format!("Failed to register Data App with error '{error}'."));
                return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
            }
        };

        let credentials = GitCredentials {
            username: request.username.clone(),
            password: request.password.clone(),
        };
        if let Err(error) = berth_vcs::clone_repository(
            &request.git_repository_url,
            &self.store.layout().repository_dir(uuid),
            &credentials,
        ) {
            status.record(Category::Vcs, error.to_string());
        }
        // The cloned tree is committed into the audit repository as plain
        // files, so its own git metadata has to go.
        if status.is_success()
            && let Err(error) = self.store.remove_git_metadata(uuid)
        {
            status.record(Category::Io, error.to_string());
        }
        if status.is_success()
            && let Err(error) = self.store.set_state(uuid, AppState::Registered)
        {
            status.record(Category::Io, error.to_string());
        }

        if status.is_success() {
            self.audit_event(&mut status, uuid, "Successfully registered Data App.");
            self.push_audit(
                &mut status,
                &format!("Cloned the newly registered Data App and assigned UUID '{uuid}'."),
            );
        }

        let response = if status.is_success() {
            LifecycleResponse::new(uuid)
        } else {
            let _ = self.store.remove_repository_dir(uuid);
            let _ = self.store.remove_management_dir(uuid);
            let _ = self.store.forget(uuid);
            let failure_line = format!(
                "Failed to register Data App with error '{}'.",
                status.message()
            );
            self.audit_event(&mut status, uuid, &failure_line);
            self.push_audit(
                &mut status,
                &format!("Rolled back registration of Data App {uuid}."),
            );
            LifecycleResponse::new(Uuid::nil())
        };

        info!(
            uuid = %response.uuid,
            statuscode = status.code(),
            "finished register/git request"
        );
        respond(response, &mut status)
    }

    /// `/update/git` — re-clone the workload's source from its origin URL
    /// using the caller's credentials. Best-effort: the state moves to
    /// UPDATED even when individual steps fail, with errors reported in
    /// the status.
    pub async fn update(&self, body: &str) -> String {
        info!("received update/git request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UpdateRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Update.allows(self.store.state_of(uuid));
        if allowed {
            if let Err(error) = self.store.set_state(uuid, AppState::Updated) {
                status.record(Category::Io, error.to_string());
            }
            if let Err(error) = self.store.remove_repository_dir(uuid) {
                status.record(Category::Io, error.to_string());
            }
            self.teardown(&mut status, uuid).await;

            match self.load_origin_request(uuid) {
                Ok(origin) => {
                    let credentials = GitCredentials {
                        username: request.username.clone(),
                        password: request.password.clone(),
                    };
                    if let Err(error) = berth_vcs::clone_repository(
                        &origin.git_repository_url,
                        &self.store.layout().repository_dir(uuid),
                        &credentials,
                    ) {
                        status.record(Category::Vcs, error.to_string());
                    } else if let Err(error) = self.store.remove_git_metadata(uuid) {
                        status.record(Category::Io, error.to_string());
                    }
                }
                Err(error) => status.record(Category::Io, error),
            }
        } else {
            status.set(Category::UpdateState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully updated Data App.",
            "Failed to update Data App",
        );
        if allowed {
            self.push_audit(&mut status, &format!("Updated Data App with UUID {uuid}."));
        }

        info!(%uuid, statuscode = status.code(), "finished update/git request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }

    /// `/status` — report the current lifecycle state. Never mutates and
    /// never pushes.
    pub async fn status(&self, body: &str) -> String {
        info!("received status request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let mut response = LifecycleResponse::new(uuid);
        let state = self.store.state_of(uuid);
        response.data_app_state = Some(state);
        self.audit_event(&mut status, uuid, "Queried status of Data App.");

        info!(%uuid, %state, statuscode = status.code(), "finished status request");
        respond(response, &mut status)
    }

    /// `/delete` — remove the workload's sources, metadata and container
    /// artifacts, release its port, and retire the UUID for good.
    /// Best-effort: the record ends up DELETED even if cleanup steps fail.
    pub async fn delete(&self, body: &str) -> String {
        info!("received delete request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Delete.allows(self.store.state_of(uuid));
        if allowed {
            // Container artifacts first: tearing them down rewrites the
            // image-metadata file, which must not outlive the management
            // directory removal below.
            self.teardown(&mut status, uuid).await;
            if let Err(error) = self.store.remove_repository_dir(uuid) {
                status.record(Category::Io, error.to_string());
            }
            if let Err(error) = self.store.remove_management_dir(uuid) {
                status.record(Category::Io, error.to_string());
            }
            if let Err(error) = self.store.set_state(uuid, AppState::Deleted) {
                status.record(Category::Io, error.to_string());
            }
            self.store.release_port(uuid);
            self.store.free(uuid);
        } else {
            status.set(Category::DeleteState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully deleted Data App.",
            "Failed to delete Data App",
        );
        if allowed {
            self.push_audit(&mut status, &format!("Deleted Data App with UUID {uuid}."));
        }

        info!(%uuid, statuscode = status.code(), "finished delete request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }

    /// `/compile` — tear down stale container artifacts, then queue the
    /// compilation; COMPILING is observable as soon as this returns.
    pub async fn compile(&self, body: &str) -> String {
        info!("received compile request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Compile.allows(self.store.state_of(uuid));
        if allowed {
            self.teardown(&mut status, uuid).await;
            if let Err(error) = self.compile.submit(uuid) {
                status.record(Category::Io, error.to_string());
            }
        } else {
            status.set(Category::CompileState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully started compilation of Data App.",
            "Failed to start compilation of Data App",
        );
        if allowed {
            self.push_audit(
                &mut status,
                &format!("Started compilation of Data App {uuid}."),
            );
        }

        info!(%uuid, statuscode = status.code(), "finished compile request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }

    /// `/deploy` — tear down stale artifacts, then queue the image build;
    /// DEPLOYING is observable as soon as this returns.
    pub async fn deploy(&self, body: &str) -> String {
        info!("received deploy request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Deploy.allows(self.store.state_of(uuid));
        if allowed {
            self.teardown(&mut status, uuid).await;
            if let Err(error) = self.container.submit_build(uuid) {
                status.record(Category::Io, error.to_string());
            }
        } else {
            status.set(Category::DeployState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully deployed Data App.",
            "Failed to deploy Data App",
        );
        if allowed {
            self.push_audit(&mut status, &format!("Deployed Data App {uuid}."));
        }

        info!(%uuid, statuscode = status.code(), "finished deploy request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }

    /// `/start` — queue the container start; STARTING is observable as
    /// soon as this returns.
    pub async fn start(&self, body: &str) -> String {
        info!("received start request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Start.allows(self.store.state_of(uuid));
        if allowed {
            if let Err(error) = self.container.submit_start(uuid) {
                status.record(Category::Io, error.to_string());
            }
        } else {
            status.set(Category::StartState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully started Data App.",
            "Failed to start Data App",
        );
        if allowed {
            self.push_audit(&mut status, &format!("Started Data App {uuid}."));
        }

        info!(%uuid, statuscode = status.code(), "finished start request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }

    /// `/dispatch` — synchronously relay the payload to the running
    /// workload and return its response body verbatim.
    pub async fn dispatch(&self, body: &str) -> String {
        info!("received dispatch request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<DispatchRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let mut response = LifecycleResponse::new(uuid);
        let allowed = Command::Dispatch.allows(self.store.state_of(uuid));
        if allowed {
            match self.store.image_data(uuid) {
                Ok(data) => match self.dispatch.dispatch(data.port, &request.payload).await {
                    Ok(payload) => response.payload = Some(payload),
                    Err(error) => status.record(Category::Io, error.to_string()),
                },
                Err(error) => status.record(Category::Io, error.to_string()),
            }
        } else {
            status.set(Category::DispatchState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully dispatched message to Data App.",
            "Failed to dispatch message to Data App",
        );
        if allowed {
            self.push_audit(
                &mut status,
                &format!("Dispatched message to Data App {uuid}."),
            );
        }

        info!(%uuid, statuscode = status.code(), "finished dispatch request");
        respond(response, &mut status)
    }

    /// `/stop` — queue the container stop; TERMINATING is observable as
    /// soon as this returns.
    pub async fn stop(&self, body: &str) -> String {
        info!("received stop request");
        let mut status = StatusCode::new();

        let Some(request) = parse::<UuidRequest>(body, &mut status) else {
            return respond(LifecycleResponse::new(Uuid::nil()), &mut status);
        };
        let uuid = request.uuid;
        if let Err(error) = request.validate() {
            note_invalid(error, &mut status);
            return respond(LifecycleResponse::new(uuid), &mut status);
        }

        let allowed = Command::Stop.allows(self.store.state_of(uuid));
        if allowed {
            if let Err(error) = self.container.submit_stop(uuid) {
                status.record(Category::Io, error.to_string());
            }
        } else {
            status.set(Category::StopState);
        }

        self.audit_outcome(
            &mut status,
            uuid,
            "Successfully stopped Data App.",
            "Failed to stop Data App",
        );
        if allowed {
            self.push_audit(&mut status, &format!("Stopped Data App {uuid}."));
        }

        info!(%uuid, statuscode = status.code(), "finished stop request");
        respond(LifecycleResponse::new(uuid), &mut status)
    }
}
