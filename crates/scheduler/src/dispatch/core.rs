use std::sync::Arc;
use std::thread::JoinHandle;

use kiln_core::{Compiler, Job};

use crate::config::SchedulerConfig;
use crate::ipc::IpcNaming;
use crate::shared::Shared;
use crate::slot::WorkerSlot;
use crate::transport::TransportFactory;

/// Where the dispatch thread sends work.
#[derive(Clone)]
pub(crate) enum Backend {
    /// Out-of-process workers, one transport per slot.
    Workers(Arc<dyn TransportFactory>),
    /// Compile on the dispatch thread itself.
    Direct(Arc<dyn Compiler>),
}

pub(super) enum Execution {
    Workers {
        slots: Vec<WorkerSlot>,
        naming: IpcNaming,
    },
    Direct(Arc<dyn Compiler>),
}

/// Owns the worker slots and moves jobs between the shared queue and the
/// workers. Runs on its own OS thread until shutdown is signalled.
pub(crate) struct DispatchThread {
    pub(super) shared: Arc<Shared>,
    pub(super) config: SchedulerConfig,
    pub(super) execution: Execution,
    /// Jobs with a result, committed to their groups on the next pass.
    pub(super) completed: Vec<Job>,
    /// Jobs from lost batches, put back at the front of the queue on the next pass.
    pub(super) lost: Vec<Job>,
}

impl DispatchThread {
    /// Build the dispatch state for the calling thread. IPC names carry the
    /// id of the thread this is called on.
    pub(crate) fn new(shared: Arc<Shared>, config: SchedulerConfig, backend: Backend) -> Self {
        let execution = match backend {
            Backend::Workers(factory) => Execution::Workers {
                slots: (0..config.slot_count())
                    .map(|i| WorkerSlot::new(i, factory.create(i)))
                    .collect(),
                naming: IpcNaming::for_current_thread(&config.working_directory),
            },
            Backend::Direct(compiler) => Execution::Direct(compiler),
        };
        Self {
            shared,
            config,
            execution,
            completed: Vec::new(),
            lost: Vec::new(),
        }
    }

    /// Start the dispatch loop on a new named thread.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        config: SchedulerConfig,
        backend: Backend,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("kiln-dispatch".into())
            .spawn(move || DispatchThread::new(shared, config, backend).run())
    }

    pub(super) fn mode(&self) -> &'static str {
        match self.execution {
            Execution::Workers { .. } => "workers",
            Execution::Direct(_) => "direct",
        }
    }
}
