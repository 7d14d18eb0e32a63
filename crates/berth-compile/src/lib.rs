//! berth-compile — asynchronous compilation of workload sources.
//!
//! The external compiler is a black box: source directory in, success or
//! failure out. Compilation runs on its own bounded pool, independent from
//! the container worker pool, so compiling one workload never delays
//! deploying another.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use berth_core::state::AppState;
use berth_store::{ResourceStore, StoreResult};

/// The external data-app compiler.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile the source tree at `source_dir`; `true` means success.
    async fn compile(&self, source_dir: &Path) -> bool;
}

/// Production compiler: spawns the configured binary with the source
/// directory as its single argument, exit code zero meaning success.
pub struct CommandCompiler {
    command: String,
}

impl CommandCompiler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, source_dir: &Path) -> bool {
        match Command::new(&self.command).arg(source_dir).status().await {
            Ok(status) => status.success(),
            Err(error) => {
                error!(command = %self.command, %error, "failed to launch compiler");
                false
            }
        }
    }
}

/// Bounded async worker driving [`Compiler`] runs.
pub struct CompileWorker {
    compiler: Arc<dyn Compiler>,
    store: Arc<ResourceStore>,
    permits: Arc<Semaphore>,
}

impl CompileWorker {
    pub fn new(compiler: Arc<dyn Compiler>, store: Arc<ResourceStore>, pool_size: usize) -> Self {
        Self {
            compiler,
            store,
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Queue a compilation. The transition to COMPILING happens before
    /// this returns, so an immediately following status query observes it;
    /// the terminal state is written only if no concurrent command has
    /// moved the workload away from COMPILING in the meantime.
    pub fn submit(&self, uuid: Uuid) -> StoreResult<()> {
        info!(%uuid, "queueing compilation");
        self.store.set_state(uuid, AppState::Compiling)?;

        let compiler = self.compiler.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        let source_dir = store.layout().repository_dir(uuid);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            info!(%uuid, "starting compilation");
            let success = compiler.compile(&source_dir).await;
            let terminal = if success {
                AppState::Compiled
            } else {
                AppState::CompilationError
            };
            match store.advance_state_if(uuid, AppState::Compiling, terminal) {
                Ok(true) => info!(%uuid, state = %terminal, "finished compilation"),
                Ok(false) => info!(%uuid, "state changed during compilation, result dropped"),
                Err(error) => error!(%uuid, %error, "failed to persist compilation result"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    use berth_store::WorkspaceLayout;

    /// Compiler stub that blocks until released and returns a fixed result.
    struct StubCompiler {
        result: bool,
        release: Notify,
        calls: AtomicUsize,
    }

    impl StubCompiler {
        fn new(result: bool) -> Arc<Self> {
            Arc::new(Self {
                result,
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Compiler for StubCompiler {
        async fn compile(&self, _source_dir: &Path) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            self.result
        }
    }

    fn open_store(dir: &Path) -> Arc<ResourceStore> {
        Arc::new(ResourceStore::open(WorkspaceLayout::new(dir), 10000).unwrap())
    }

    async fn wait_for_state(store: &ResourceStore, uuid: Uuid, state: AppState) {
        for _ in 0..200 {
            if store.state_of(uuid) == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "workload never reached {state}, stuck in {}",
            store.state_of(uuid)
        );
    }

    #[tokio::test]
    async fn submit_sets_compiling_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let stub = StubCompiler::new(true);
        let worker = CompileWorker::new(stub.clone(), store.clone(), 2);

        let uuid = store.register("{}").unwrap();
        worker.submit(uuid).unwrap();
        assert_eq!(store.state_of(uuid), AppState::Compiling);

        stub.release.notify_one();
        wait_for_state(&store, uuid, AppState::Compiled).await;
    }

    #[tokio::test]
    async fn failed_compile_lands_in_compilation_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let stub = StubCompiler::new(false);
        let worker = CompileWorker::new(stub.clone(), store.clone(), 2);

        let uuid = store.register("{}").unwrap();
        worker.submit(uuid).unwrap();
        stub.release.notify_one();
        wait_for_state(&store, uuid, AppState::CompilationError).await;
    }

    #[tokio::test]
    async fn late_result_does_not_clobber_concurrent_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let stub = StubCompiler::new(true);
        let worker = CompileWorker::new(stub.clone(), store.clone(), 2);

        let uuid = store.register("{}").unwrap();
        worker.submit(uuid).unwrap();

        // A delete slips in while the compiler is still running.
        store.set_state(uuid, AppState::Deleted).unwrap();
        stub.release.notify_one();

        // Give the worker time to (not) write its result.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.state_of(uuid), AppState::Deleted);
    }

    #[tokio::test]
    async fn command_compiler_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ok = CommandCompiler::new("true");
        assert!(ok.compile(dir.path()).await);

        let fail = CommandCompiler::new("false");
        assert!(!fail.compile(dir.path()).await);

        let missing = CommandCompiler::new("definitely-not-a-real-binary");
        assert!(!missing.compile(dir.path()).await);
    }
}
