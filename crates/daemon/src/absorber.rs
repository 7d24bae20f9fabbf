// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! The absorber: serves peer emitters.
//!
//! Accepts a `RemoteExecute`, consults its own cache, and otherwise runs
//! the compiler with the preprocessed source on stdin and the object on
//! stdout. The reply always carries a status; the object rides along on
//! success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Entry, FileCache};
use crate::compiler::{self, CompilerRegistry};
use crate::config::{AbsorberConfig, VersionConfig};
use crate::error::Result;
use crate::net::{Connection, EndPoint, Listener, MessageHandler, Timeouts};
use crate::pool::{ShutdownToken, TaskRunner, WorkerPool};
use crate::proto::{RemoteExecute, RemoteResult, Status, StatusCode, Universal};
use crate::process::ProcessSpec;
use crate::queue::{DEFAULT_SHARD, TaskQueue};
use crate::runtime::Runtime;

/// A compile fed on stdin should never take this long.
const COMPILE_TIMEOUT: Duration = Duration::from_secs(10);

type AbsorberTask = (Arc<Connection>, RemoteExecute);

pub struct Absorber {
    inner: Arc<AbsorberInner>,
    pool: Option<WorkerPool>,
    listener: Option<Listener>,
    runner: Arc<TaskRunner>,
}

struct AbsorberInner {
    config: AbsorberConfig,
    runtime: Runtime,
    registry: CompilerRegistry,
    cache: Option<Arc<FileCache>>,
    tasks: Arc<TaskQueue<AbsorberTask>>,
}

impl Absorber {
    /// The cache is shared with the emitter half when both run in one
    /// daemon.
    pub fn new(
        versions: &[VersionConfig],
        absorber: AbsorberConfig,
        cache: Option<Arc<FileCache>>,
        runtime: Runtime,
    ) -> Absorber {
        Absorber {
            inner: Arc::new(AbsorberInner {
                config: absorber.clone(),
                runtime,
                registry: CompilerRegistry::new(versions),
                cache,
                tasks: Arc::new(TaskQueue::new(absorber.queue_capacity, None)),
            }),
            pool: None,
            listener: None,
            runner: Arc::new(TaskRunner::new("absorber-io", 4)),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut pool = WorkerPool::new();
        {
            let inner = Arc::clone(&self.inner);
            pool.add_worker(
                "absorber-execute",
                move |token| inner.do_execute(token),
                self.inner.config.threads.max(1),
            );
        }

        let inner = Arc::clone(&self.inner);
        let handler: Arc<MessageHandler> = Arc::new(move |connection: &Arc<Connection>, result| {
            let message = match result {
                Ok(message) => message,
                Err(status) => {
                    if status.status_code() != StatusCode::Inconsequent {
                        tracing::debug!("dropping peer connection: {}", status.description);
                    }
                    return false;
                }
            };
            inner.handle_message(connection, message)
        });

        let listener = Listener::bind(
            EndPoint::Tcp(self.inner.config.host.clone(), self.inner.config.port),
            Timeouts::default(),
            Arc::clone(&self.runner),
            handler,
        )?;

        self.pool = Some(pool);
        self.listener = Some(listener);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            listener.stop();
        }
        self.inner.tasks.close();
        self.pool.take();
        self.listener.take();
    }
}

impl Drop for Absorber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AbsorberInner {
    fn handle_message(&self, connection: &Arc<Connection>, message: Universal) -> bool {
        let Some(execute) = message.remote_execute else {
            connection.send_status(Status::new(
                StatusCode::Inconsequent,
                "expected a remote compilation request",
            ));
            return false;
        };
        if execute.source.is_empty() || execute.flags.is_none() {
            connection.send_status(Status::new(
                StatusCode::BadMessage,
                "request misses source or flags",
            ));
            return false;
        }
        if !self
            .tasks
            .push((Arc::clone(connection), execute), DEFAULT_SHARD)
        {
            connection.send_status(Status::new(StatusCode::Overload, "absorber queue is full"));
            return false;
        }
        true
    }

    fn do_execute(&self, token: &ShutdownToken) {
        while !token.is_shutting_down() {
            let Some((connection, mut incoming)) = self.tasks.pop(DEFAULT_SHARD) else {
                break;
            };
            let Some(flags) = incoming.flags.as_mut() else {
                continue;
            };

            // The cache key is fixed before the flags are rewritten for
            // the stdin/stdout invocation.
            let command_line = compiler::cache_command_line(flags);
            let version = flags
                .compiler
                .as_ref()
                .map(|compiler| compiler.version.clone())
                .unwrap_or_default();

            if let Some(entry) = self.search_cache(&incoming.source, &command_line, &version) {
                let reply = Universal::from_result(
                    Status::ok(entry.stderr.clone()),
                    RemoteResult {
                        obj: entry.object,
                        deps: None,
                    },
                );
                send_and_close(&connection, &reply);
                continue;
            }

            let Some(flags) = incoming.flags.as_mut() else {
                continue;
            };
            if let Err(status) = self.registry.setup(flags) {
                connection.send_status(status);
                continue;
            }

            flags.output = Some("-".to_string());
            flags.input = None;
            flags.deps_file = None;
            compiler::remap_preprocessed_language(flags);

            let Some(program) = flags.compiler.as_ref().and_then(|c| c.path.clone()) else {
                connection.send_status(Status::new(
                    StatusCode::Execution,
                    "no compiler path resolved",
                ));
                continue;
            };
            let spec = ProcessSpec {
                program: PathBuf::from(program),
                args: compiler::compile_args(flags),
                cwd: std::env::temp_dir(),
                uid: None,
                stdin: Some(incoming.source.clone()),
                timeout: Some(COMPILE_TIMEOUT),
            };

            let (status, stdout) = match self.runtime.process.run(&spec) {
                Err(e) => {
                    tracing::warn!("compilation failed with error: {}", e);
                    (Status::new(StatusCode::Execution, e.to_string()), Vec::new())
                }
                Ok(output) if !output.success => {
                    let description = if output.stderr.is_empty() {
                        "without errors".to_string()
                    } else {
                        String::from_utf8_lossy(&output.stderr).into_owned()
                    };
                    tracing::warn!("compilation failed with error: {}", description);
                    (Status::new(StatusCode::Execution, description), output.stdout)
                }
                Ok(output) => {
                    tracing::info!("external compilation successful");
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    (Status::ok(stderr), output.stdout)
                }
            };

            if status.status_code() == StatusCode::Ok {
                let entry = Entry {
                    object: stdout.clone(),
                    deps: Vec::new(),
                    stderr: status.description.clone(),
                };
                self.update_cache(&incoming.source, &command_line, &version, &entry);
            }

            let reply = Universal::from_result(
                status,
                RemoteResult {
                    obj: stdout,
                    deps: None,
                },
            );
            send_and_close(&connection, &reply);
        }
    }

    fn search_cache(&self, source: &[u8], command_line: &str, version: &str) -> Option<Entry> {
        self.cache
            .as_ref()?
            .find_simple(source, command_line, version)
    }

    fn update_cache(&self, source: &[u8], command_line: &str, version: &str, entry: &Entry) {
        if let Some(cache) = self.cache.as_ref() {
            cache.store_simple(source, command_line, version, entry);
        }
    }
}

fn send_and_close(connection: &Arc<Connection>, reply: &Universal) {
    if let Err(status) = connection.send(reply) {
        tracing::debug!("failed to reply to peer: {}", status.description);
    }
    connection.close();
}

#[cfg(test)]
#[path = "absorber_tests.rs"]
mod tests;
