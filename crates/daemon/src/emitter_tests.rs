#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use crate::config::{CacheConfig, EmitterConfig, RemoteConfig, VersionConfig};
use crate::process::{ProcessOutput, ProcessRunner, ProcessSpec};
use crate::proto::Compiler;

fn test_config(dir: &Path) -> Config {
    Config {
        socket_path: dir.join("anvild.sock"),
        cache: CacheConfig {
            path: dir.join("cache"),
            ..Default::default()
        },
        emitter: EmitterConfig::default(),
        absorber: None,
        versions: vec![VersionConfig {
            version: "clang version 17.0.6".to_string(),
            path: std::path::PathBuf::from("/usr/bin/clang"),
            plugins: vec![],
        }],
    }
}

/// Scripted compiler: preprocessor runs echo a fixed source, compile runs
/// write the requested output file.
struct ScriptedRunner {
    calls: Mutex<Vec<ProcessSpec>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedRunner {
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, spec: &ProcessSpec) -> std::io::Result<ProcessOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        if spec.args.contains(&"-E".to_string()) {
            return Ok(ProcessOutput {
                success: true,
                stdout: b"# preprocessed\nint main() {}\n".to_vec(),
                stderr: Vec::new(),
            });
        }
        if let Some(position) = spec.args.iter().position(|a| a == "-o") {
            let output = Path::new(&spec.args[position + 1]);
            let output = if output.is_absolute() {
                output.to_path_buf()
            } else {
                spec.cwd.join(output)
            };
            std::fs::write(output, b"OBJECT").unwrap();
        }
        Ok(ProcessOutput {
            success: true,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

fn request_flags() -> Flags {
    Flags {
        compiler: Some(Compiler {
            path: None,
            version: "clang version 17.0.6".to_string(),
            plugins: vec![],
        }),
        other: vec!["-cc1".to_string()],
        action: "-emit-obj".to_string(),
        input: Some("main.cc".to_string()),
        output: Some("main.o".to_string()),
        deps_file: None,
        language: Some("c++".to_string()),
        sanitize_blacklist: None,
        cc_only: vec![],
        non_cached: vec!["-I/usr/include".to_string()],
        non_direct: vec![],
    }
}

fn task_pair(dir: &Path) -> (Task, Connection) {
    let (server, client) = UnixStream::pair().unwrap();
    let timeouts = Timeouts {
        connect: Duration::from_secs(1),
        read: Duration::from_secs(2),
        send: Duration::from_secs(2),
    };
    let task = Task {
        connection: Arc::new(Connection::from_unix(server, &timeouts).unwrap()),
        message: LocalExecute {
            current_dir: dir.to_string_lossy().into_owned(),
            user_id: None,
            flags: Some(request_flags()),
        },
        source: None,
    };
    (task, Connection::from_unix(client, &timeouts).unwrap())
}

#[test]
fn strip_remote_flags_removes_machine_state() {
    let mut flags = request_flags();
    if let Some(compiler) = flags.compiler.as_mut() {
        compiler.path = Some("/usr/bin/clang".to_string());
    }
    flags.deps_file = Some("main.d".to_string());

    let stripped = strip_remote_flags(&flags);
    assert!(stripped.compiler.unwrap().path.is_none());
    assert!(stripped.output.is_none());
    assert!(stripped.input.is_none());
    assert!(stripped.deps_file.is_none());
    assert!(stripped.non_cached.is_empty());
    // Cacheable categories survive.
    assert_eq!(stripped.other, vec!["-cc1".to_string()]);
    assert_eq!(stripped.language.as_deref(), Some("c++"));
}

#[test]
fn shard_for_is_stable_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.emitter.remotes = vec![
        RemoteConfig {
            host: "10.0.0.2".to_string(),
            port: 7766,
            threads: 2,
            shard: Some(0),
            disabled: false,
        },
        RemoteConfig {
            host: "10.0.0.3".to_string(),
            port: 7766,
            threads: 2,
            shard: Some(3),
            disabled: false,
        },
    ];
    let emitter = Emitter::new(config, Runtime::with_runner(ScriptedRunner::new())).unwrap();
    assert_eq!(emitter.inner.shard_count, 4);

    let message = LocalExecute {
        current_dir: "/work".to_string(),
        user_id: None,
        flags: Some(request_flags()),
    };
    let shard = emitter.inner.shard_for(&message);
    assert_eq!(shard, emitter.inner.shard_for(&message));
    assert!(shard < 4);
}

#[test]
fn shardless_config_uses_the_default_shard() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();
    let message = LocalExecute {
        current_dir: "/work".to_string(),
        user_id: None,
        flags: Some(request_flags()),
    };
    assert_eq!(emitter.inner.shard_for(&message), DEFAULT_SHARD);
}

#[test]
fn restore_from_cache_writes_output_and_replies_ok() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();
    let (task, client) = task_pair(dir.path());

    let entry = Entry {
        object: b"CACHED OBJECT".to_vec(),
        deps: Vec::new(),
        stderr: "warning: cached".to_string(),
    };
    assert!(emitter.inner.restore_from_cache(&task, &entry, None));

    let reply = client.read().unwrap();
    let status = reply.status.unwrap();
    assert_eq!(status.status_code(), StatusCode::Ok);
    assert_eq!(status.description, "warning: cached");
    assert_eq!(
        std::fs::read(dir.path().join("main.o")).unwrap(),
        b"CACHED OBJECT"
    );
}

#[test]
fn handle_message_rejects_non_requests() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();
    let (task, client) = task_pair(dir.path());

    let keep = emitter
        .inner
        .handle_message(&task.connection, Universal::default());
    assert!(!keep);
    let reply = client.read().unwrap();
    assert_eq!(reply.status.unwrap().status_code(), StatusCode::Inconsequent);
}

#[test]
fn handle_message_rejects_missing_flags() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();
    let (task, client) = task_pair(dir.path());

    let message = Universal::from_local_execute(LocalExecute {
        current_dir: "/work".to_string(),
        user_id: None,
        flags: None,
    });
    assert!(!emitter.inner.handle_message(&task.connection, message));
    let reply = client.read().unwrap();
    assert_eq!(reply.status.unwrap().status_code(), StatusCode::BadMessage);
}

#[test]
fn handle_message_enqueues_to_the_cache_stage() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();
    let (task, _client) = task_pair(dir.path());

    let message = Universal::from_local_execute(task.message.clone());
    assert!(emitter.inner.handle_message(&task.connection, message));
    assert_eq!(emitter.inner.cache_tasks.size(), 1);
    assert_eq!(emitter.inner.all_tasks.size(), 0);
}

#[test]
fn generate_source_resolves_the_toolchain() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let emitter = Emitter::new(
        test_config(dir.path()),
        Runtime::with_runner(Arc::clone(&runner) as Arc<dyn ProcessRunner>),
    )
            .unwrap();
    let (task, _client) = task_pair(dir.path());

    let source = emitter.inner.generate_source(&task).unwrap();
    assert!(source.starts_with(b"# preprocessed"));

    let calls = runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, std::path::PathBuf::from("/usr/bin/clang"));
    assert!(calls[0].args.contains(&"-E".to_string()));
    assert!(calls[0].timeout.is_some());
}

#[test]
fn read_back_entry_collects_object_and_deps() {
    let dir = tempfile::tempdir().unwrap();
    let emitter =
        Emitter::new(test_config(dir.path()), Runtime::with_runner(ScriptedRunner::new()))
            .unwrap();

    std::fs::write(dir.path().join("main.o"), b"OBJ").unwrap();
    std::fs::write(dir.path().join("main.d"), b"main.o: main.cc\n").unwrap();

    let mut message = LocalExecute {
        current_dir: dir.path().to_string_lossy().into_owned(),
        user_id: None,
        flags: Some(request_flags()),
    };
    if let Some(flags) = message.flags.as_mut() {
        flags.deps_file = Some("main.d".to_string());
    }

    let entry = emitter.inner.read_back_entry(&message, "warnings").unwrap();
    assert_eq!(entry.object, b"OBJ");
    assert_eq!(entry.deps, b"main.o: main.cc\n");
    assert_eq!(entry.stderr, "warnings");
}
