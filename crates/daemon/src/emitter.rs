// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! The emitter: the client-facing daemon pipeline.
//!
//! Every incoming compilation walks cache check -> remote dispatch ->
//! local fallback, through four queues:
//!
//! - `cache_tasks`: entry point while the cache is enabled;
//! - `all_tasks`: cache misses, consumed by the remote dispatch workers;
//! - `failed_tasks`: remote casualties, strictly preferred by the local
//!   fallback;
//! - `local_tasks`: the aggregation the fallback workers actually pop —
//!   `failed_tasks` plus, unless `only_failed`, `all_tasks`, so local
//!   cores race the farm for fresh work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheOptions, Entry, FileCache};
use crate::compiler::{self, CompilerRegistry};
use crate::config::Config;
use crate::error::Result;
use crate::hash;
use crate::net::balancer::{Balancer, Remote};
use crate::net::{Connection, EndPoint, Listener, MessageHandler, Timeouts};
use crate::pool::{ShutdownToken, TaskRunner, WorkerPool};
use crate::proto::{Flags, LocalExecute, RemoteExecute, Status, StatusCode, Universal};
use crate::queue::aggregator::QueueAggregator;
use crate::queue::{DEFAULT_SHARD, TaskQueue};
use crate::runtime::Runtime;

/// One in-flight compilation: the client connection, the request, and the
/// preprocessed source once some stage produced it.
pub struct Task {
    pub connection: Arc<Connection>,
    pub message: LocalExecute,
    pub source: Option<Vec<u8>>,
}

pub struct Emitter {
    inner: Arc<EmitterInner>,
    pool: Option<WorkerPool>,
    listener: Option<Listener>,
    runner: Arc<TaskRunner>,
}

struct EmitterInner {
    config: Config,
    runtime: Runtime,
    registry: CompilerRegistry,
    cache: Option<Arc<FileCache>>,
    cache_tasks: Arc<TaskQueue<Task>>,
    all_tasks: Arc<TaskQueue<Task>>,
    failed_tasks: Arc<TaskQueue<Task>>,
    local_tasks: Arc<QueueAggregator<Task>>,
    balancer: Balancer,
    /// Number of task shards; zero when no remote declares one.
    shard_count: u32,
    timeouts: Timeouts,
}

impl Emitter {
    pub fn new(config: Config, runtime: Runtime) -> Result<Emitter> {
        let cache = if config.cache.disabled {
            None
        } else {
            let mut options = CacheOptions::new(config.cache.path.clone());
            options.max_size = config.cache.max_size;
            options.snappy = config.cache.snappy;
            options.clean_period = Duration::from_secs(config.cache.clean_period.max(1));
            Some(FileCache::open(options)?)
        };

        let registry = CompilerRegistry::new(&config.versions);
        let pop_timeout = Duration::from_secs(config.emitter.pop_timeout.max(1));

        let cache_tasks = Arc::new(TaskQueue::unbounded());
        let all_tasks = Arc::new(TaskQueue::new(
            config.emitter.queue_capacity,
            Some(pop_timeout),
        ));
        let failed_tasks = Arc::new(TaskQueue::unbounded());

        let mut local_tasks = QueueAggregator::new();
        local_tasks.aggregate(Arc::clone(&failed_tasks));
        if !config.emitter.only_failed {
            local_tasks.aggregate(Arc::clone(&all_tasks));
        }

        let remotes: Vec<Remote> = config
            .emitter
            .remotes
            .iter()
            .filter(|remote| !remote.disabled)
            .map(|remote| Remote {
                endpoint: EndPoint::Tcp(remote.host.clone(), remote.port),
                threads: remote.threads,
                shard: remote.shard,
            })
            .collect();
        let shard_count = remotes
            .iter()
            .filter_map(|remote| remote.shard)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        let inner = Arc::new(EmitterInner {
            config,
            runtime,
            registry,
            cache,
            cache_tasks,
            all_tasks,
            failed_tasks,
            local_tasks: Arc::new(local_tasks),
            balancer: Balancer::new(remotes),
            shard_count,
            timeouts: Timeouts::default(),
        });

        Ok(Emitter {
            inner,
            pool: None,
            listener: None,
            runner: Arc::new(TaskRunner::new("emitter-io", 4)),
        })
    }

    /// Spawn the stage workers and start serving the client socket.
    pub fn run(&mut self) -> Result<()> {
        let mut pool = WorkerPool::new();

        {
            let inner = Arc::clone(&self.inner);
            pool.add_worker(
                "local-execute",
                move |token| inner.do_local_execute(token),
                self.inner.config.emitter.threads.max(1),
            );
        }

        if self.inner.cache.is_some() {
            let cache_threads = std::thread::available_parallelism()
                .map(|n| n.get() as u32 * 2)
                .unwrap_or(4);
            let inner = Arc::clone(&self.inner);
            pool.add_worker(
                "cache-check",
                move |token| inner.do_check_cache(token),
                cache_threads,
            );
        }

        for remote in self.inner.balancer.remotes() {
            let shard = remote.shard.unwrap_or(DEFAULT_SHARD);
            let inner = Arc::clone(&self.inner);
            pool.add_worker(
                "remote-execute",
                move |token| inner.do_remote_execute(token, shard),
                remote.threads.max(1),
            );
        }

        let handler = self.message_handler();
        let listener = Listener::bind(
            EndPoint::Unix(self.inner.config.socket_path.clone()),
            self.inner.timeouts,
            Arc::clone(&self.runner),
            handler,
        )?;

        self.pool = Some(pool);
        self.listener = Some(listener);
        tracing::info!("emitter serving on {}", self.inner.config.socket_path.display());
        Ok(())
    }

    fn message_handler(&self) -> Arc<MessageHandler> {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |connection: &Arc<Connection>, result| {
            let message = match result {
                Ok(message) => message,
                Err(status) => {
                    if status.status_code() != StatusCode::Inconsequent {
                        tracing::debug!("dropping connection: {}", status.description);
                    }
                    return false;
                }
            };
            inner.handle_message(connection, message)
        })
    }

    /// The artifact cache, for sharing with an absorber in the same
    /// process.
    pub fn cache(&self) -> Option<Arc<FileCache>> {
        self.inner.cache.clone()
    }

    /// Close the queues, drain the workers, then tear the sockets down.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            listener.stop();
        }
        self.inner.cache_tasks.close();
        self.inner.all_tasks.close();
        self.inner.failed_tasks.close();
        self.inner.local_tasks.close();
        self.pool.take();
        self.listener.take();
        tracing::info!("emitter stopped");
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EmitterInner {
    /// Ingress: validate and enqueue. Returning false closes the client
    /// connection.
    fn handle_message(&self, connection: &Arc<Connection>, message: Universal) -> bool {
        let Some(local) = message.local_execute else {
            connection.send_status(Status::new(
                StatusCode::Inconsequent,
                "expected a compilation request",
            ));
            return false;
        };
        if local.flags.is_none() || local.current_dir.is_empty() {
            connection.send_status(Status::new(
                StatusCode::BadMessage,
                "request misses flags or a working directory",
            ));
            return false;
        }

        let shard = self.shard_for(&local);
        let task = Task {
            connection: Arc::clone(connection),
            message: local,
            source: None,
        };

        let accepted = if self.cache.is_some() {
            self.cache_tasks.push(task, DEFAULT_SHARD)
        } else {
            self.all_tasks.push(task, shard)
        };
        if !accepted {
            connection.send_status(Status::new(StatusCode::Overload, "emitter queue is full"));
            return false;
        }
        true
    }

    /// Cache stage: direct tier, then preprocess, then simple tier.
    fn do_check_cache(&self, token: &ShutdownToken) {
        while !token.is_shutting_down() {
            let Some(mut task) = self.cache_tasks.pop(DEFAULT_SHARD) else {
                break;
            };

            if let Some(entry) = self.search_direct(&task)
                && self.restore_from_cache(&task, &entry, None)
            {
                continue;
            }

            let shard = self.shard_for(&task.message);
            match self.generate_source(&task) {
                Some(source) => task.source = Some(source),
                None => {
                    // No point compiling what does not preprocess; let the
                    // full compiler produce the diagnostic.
                    self.failed_tasks.push(task, shard);
                    continue;
                }
            }

            if let Some(entry) = self.search_simple(&task) {
                let source = task.source.clone().unwrap_or_default();
                if self.restore_from_cache(&task, &entry, Some(&source)) {
                    continue;
                }
            }

            if !self.all_tasks.push(task, shard) {
                tracing::warn!("dispatch queue rejected a task");
            }
        }
    }

    /// Local fallback stage: the real compiler on this machine.
    fn do_local_execute(&self, token: &ShutdownToken) {
        while !token.is_shutting_down() {
            let Some(mut task) = self.local_tasks.pop() else {
                break;
            };
            let current_dir = task.message.current_dir.clone();
            let uid = task.message.user_id;
            let Some(flags) = task.message.flags.as_mut() else {
                continue;
            };

            if let Err(status) = self.registry.setup(flags) {
                task.connection.send_status(status);
                continue;
            }

            let Some(spec) = compiler::compile_spec(flags, Path::new(&current_dir), uid) else {
                task.connection.send_status(Status::new(
                    StatusCode::Execution,
                    "no compiler path resolved",
                ));
                continue;
            };

            let status = match self.runtime.process.run(&spec) {
                Err(e) => Status::new(StatusCode::Execution, e.to_string()),
                Ok(output) if !output.success => {
                    let description = if output.stderr.is_empty() {
                        "without errors".to_string()
                    } else {
                        String::from_utf8_lossy(&output.stderr).into_owned()
                    };
                    Status::new(StatusCode::Execution, description)
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    tracing::info!("local compilation successful: {:?}", flags.input);

                    if let Some(source) = &task.source
                        && let Some(entry) = self.read_back_entry(&task.message, &stderr)
                    {
                        let flags = task.message.flags.clone().unwrap_or_default();
                        self.update_simple_cache(&flags, source, &entry);
                        self.update_direct_cache(&task.message, source, &entry);
                    }
                    Status::ok(stderr)
                }
            };
            task.connection.send_status(status);
        }
    }

    /// Remote dispatch stage: one worker set per remote, biased toward
    /// that remote's shard.
    fn do_remote_execute(&self, token: &ShutdownToken, shard: u32) {
        let strict_limit = self.config.emitter.strict_shard_limit;
        while !token.is_shutting_down() {
            let Some(mut task) = self.all_tasks.pop_or_shutdown(token, strict_limit, shard)
            else {
                break;
            };
            let task_shard = self.shard_for(&task.message);

            if task.source.is_none() {
                match self.generate_source(&task) {
                    Some(source) => task.source = Some(source),
                    None => {
                        self.failed_tasks.push(task, task_shard);
                        continue;
                    }
                }
            }

            let Some(lease) = self.balancer.pick(Some(shard)) else {
                if self.config.emitter.only_failed {
                    // Nothing may run locally for fresh tasks; punt.
                    task.connection
                        .send_status(Status::new(StatusCode::Overload, "all remotes are busy"));
                } else {
                    self.failed_tasks.push(task, task_shard);
                }
                continue;
            };

            let endpoint = lease.remote().endpoint.clone();
            match self.execute_remotely(&task, &endpoint) {
                Ok(description) => {
                    task.connection.send_status(Status::ok(description));
                }
                Err(()) => {
                    self.failed_tasks.push(task, task_shard);
                }
            }
        }
    }

    /// One remote round trip. `Err` means the task goes to the failed
    /// queue; the remote is attempted once per task.
    fn execute_remotely(&self, task: &Task, endpoint: &EndPoint) -> std::result::Result<String, ()> {
        let Some(flags) = task.message.flags.as_ref() else {
            return Err(());
        };
        let source = task.source.clone().unwrap_or_default();

        let connection = Connection::connect(endpoint, &self.timeouts).map_err(|e| {
            tracing::warn!("failed to connect to {}: {}", endpoint, e);
        })?;

        let outgoing = Universal::from_remote_execute(RemoteExecute {
            flags: Some(strip_remote_flags(flags)),
            source,
        });
        connection.send(&outgoing).map_err(|status| {
            tracing::warn!("failed to send to {}: {}", endpoint, status.description);
        })?;

        let reply = connection.read().map_err(|status| {
            tracing::warn!("no reply from {}: {}", endpoint, status.description);
        })?;

        if let Some(status) = &reply.status
            && status.status_code() != StatusCode::Ok
        {
            tracing::warn!(
                "remote compilation failed with error(s): {}",
                status.description
            );
            return Err(());
        }
        let Some(result) = reply.remote_result else {
            tracing::warn!("remote compilation successful, but no results returned");
            return Err(());
        };
        let description = reply
            .status
            .map(|status| status.description)
            .unwrap_or_default();

        let output_path =
            compiler::resolve_path(flags.output.as_deref().unwrap_or(""), &task.message.current_dir);
        std::fs::write(&output_path, &result.obj).map_err(|e| {
            tracing::warn!("failed to write {}: {}", output_path.display(), e);
        })?;
        self.apply_owner(&output_path, task.message.user_id);
        tracing::info!("remote compilation successful: {:?}", flags.input);

        if let Some(source) = &task.source {
            let deps = match result.deps {
                Some(deps) => deps,
                None => self.read_deps_file(&task.message).unwrap_or_default(),
            };
            let entry = Entry {
                object: result.obj,
                deps,
                stderr: description.clone(),
            };
            self.update_simple_cache(flags, source, &entry);
            self.update_direct_cache(&task.message, source, &entry);
        }

        Ok(description)
    }

    /// Write the cached artifact to the client's output path and answer
    /// OK. Failure falls back to the normal pipeline, not to an error.
    fn restore_from_cache(&self, task: &Task, entry: &Entry, warm_source: Option<&[u8]>) -> bool {
        let Some(flags) = task.message.flags.as_ref() else {
            return false;
        };
        let output_path =
            compiler::resolve_path(flags.output.as_deref().unwrap_or(""), &task.message.current_dir);

        if let Err(e) = std::fs::write(&output_path, &entry.object) {
            tracing::warn!("failed to restore {}: {}", output_path.display(), e);
            return false;
        }
        self.apply_owner(&output_path, task.message.user_id);

        if let Some(source) = warm_source {
            // A simple-tier hit on a file the direct tier has not seen yet
            // warms the direct tier for the next build.
            self.update_direct_cache(&task.message, source, entry);
        }

        task.connection.send_status(Status::ok(entry.stderr.clone()));
        true
    }

    fn search_direct(&self, task: &Task) -> Option<Entry> {
        let cache = self.cache.as_ref()?;
        if !self.config.cache.direct {
            return None;
        }
        let flags = task.message.flags.as_ref()?;
        let input =
            compiler::resolve_path(flags.input.as_deref()?, &task.message.current_dir);
        let raw = std::fs::read(&input).ok()?;
        let command_line =
            compiler::direct_command_line(flags, Path::new(&task.message.current_dir));
        let entry = cache.find_direct(&raw, &command_line, self.version_of(flags));
        if entry.is_none() {
            tracing::debug!("direct cache miss: {:?}", flags.input);
        }
        entry
    }

    fn search_simple(&self, task: &Task) -> Option<Entry> {
        let cache = self.cache.as_ref()?;
        let flags = task.message.flags.as_ref()?;
        let source = task.source.as_ref()?;
        let entry = cache.find_simple(
            source,
            &compiler::cache_command_line(flags),
            self.version_of(flags),
        );
        if entry.is_none() {
            tracing::debug!("cache miss: {:?}", flags.input);
        }
        entry
    }

    fn update_simple_cache(&self, flags: &Flags, source: &[u8], entry: &Entry) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        cache.store_simple(
            source,
            &compiler::cache_command_line(flags),
            self.version_of(flags),
            entry,
        );
    }

    fn update_direct_cache(&self, message: &LocalExecute, source: &[u8], entry: &Entry) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if !self.config.cache.direct {
            return;
        }
        let Some(flags) = message.flags.as_ref() else {
            return;
        };
        if entry.deps.is_empty() {
            tracing::debug!("can't update direct cache without deps: {:?}", flags.input);
            return;
        }
        let Some(input) = flags.input.as_deref() else {
            return;
        };

        let current_dir = Path::new(&message.current_dir);
        let input_path = compiler::resolve_path(input, &message.current_dir);
        let (Some(headers), Ok(raw)) = (
            compiler::parse_deps(&entry.deps, current_dir),
            std::fs::read(&input_path),
        ) else {
            tracing::warn!("failed to parse deps or read input {}", input_path.display());
            return;
        };

        let handled = hash::hash_handled(
            source,
            &compiler::cache_command_line(flags),
            self.version_of(flags),
        );
        cache.store_direct(
            &raw,
            &compiler::direct_command_line(flags, current_dir),
            self.version_of(flags),
            &headers,
            &handled,
        );
    }

    /// Preprocess the task's input into a handled source.
    fn generate_source(&self, task: &Task) -> Option<Vec<u8>> {
        let mut flags = task.message.flags.clone()?;
        if flags.compiler.as_ref()?.path.is_none() {
            self.registry.setup(&mut flags).ok()?;
        }
        compiler::preprocess(
            self.runtime.process.as_ref(),
            &flags,
            Path::new(&task.message.current_dir),
        )
    }

    /// Read the freshly compiled object (and deps) back for the cache.
    fn read_back_entry(&self, message: &LocalExecute, stderr: &str) -> Option<Entry> {
        let flags = message.flags.as_ref()?;
        let output_path =
            compiler::resolve_path(flags.output.as_deref()?, &message.current_dir);
        let object = std::fs::read(&output_path).ok()?;
        let deps = match flags.deps_file.as_deref() {
            Some(deps_file) => {
                std::fs::read(compiler::resolve_path(deps_file, &message.current_dir)).ok()?
            }
            None => Vec::new(),
        };
        Some(Entry {
            object,
            deps,
            stderr: stderr.to_string(),
        })
    }

    fn read_deps_file(&self, message: &LocalExecute) -> Option<Vec<u8>> {
        let flags = message.flags.as_ref()?;
        let deps_file = flags.deps_file.as_deref()?;
        std::fs::read(compiler::resolve_path(deps_file, &message.current_dir)).ok()
    }

    fn apply_owner(&self, path: &Path, uid: Option<u32>) {
        if let Some(uid) = uid
            && let Err(e) = std::os::unix::fs::chown(path, Some(uid), None)
        {
            tracing::warn!("failed to change owner for {}: {}", path.display(), e);
        }
    }

    fn version_of<'a>(&self, flags: &'a Flags) -> &'a str {
        flags
            .compiler
            .as_ref()
            .map(|compiler| compiler.version.as_str())
            .unwrap_or("")
    }

    fn shard_for(&self, message: &LocalExecute) -> u32 {
        if self.shard_count == 0 {
            return DEFAULT_SHARD;
        }
        let input = message
            .flags
            .as_ref()
            .and_then(|flags| flags.input.as_deref())
            .unwrap_or("");
        let key = compiler::resolve_path(input, &message.current_dir);
        hash::shard_of(key.as_os_str().as_encoded_bytes(), self.shard_count)
    }
}

/// The remote compiles from the preprocessed source it is handed; paths
/// and per-machine flags stay home.
pub(crate) fn strip_remote_flags(flags: &Flags) -> Flags {
    let mut stripped = flags.clone();
    if let Some(compiler) = stripped.compiler.as_mut() {
        compiler.path = None;
    }
    stripped.output = None;
    stripped.input = None;
    stripped.deps_file = None;
    stripped.non_cached.clear();
    stripped
}

#[cfg(test)]
#[path = "emitter_tests.rs"]
mod tests;
